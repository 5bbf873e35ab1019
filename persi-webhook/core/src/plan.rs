use crate::{binding::BindingSet, BINDING_TYPE};
use persi_webhook_k8s_api::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec,
    SecurityContext, Volume, VolumeMount,
};
use tracing::{debug, warn};

/// The owner applied by ownership fix-up init containers.
pub const DEFAULT_OWNER: &str = "vcap:vcap";

/// The group id used when a pod declares no user or group.
pub const DEFAULT_GROUP_ID: i64 = 2000;

/// Describes the pod changes made alongside each new mount.
///
/// Exactly one policy is active for a planner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Only volumes and mounts are added.
    #[default]
    Mounts,

    /// An init container changes the ownership of each new mount path.
    InitContainers { owner: String },

    /// The pod's `runAsGroup` and `fsGroup` are set to a single group id.
    FsGroup { default_gid: i64 },
}

/// Applies bindings to a pod.
#[derive(Clone, Debug, Default)]
pub struct Planner {
    policy: Policy,
}

/// Counts the mounts considered by [`Planner::apply`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Planned {
    pub added: usize,
    pub skipped: usize,
}

// === impl Planner ===

impl Planner {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Adds a claim-backed volume and a mount on the container at index
    /// `container` for every binding mount, in order.
    ///
    /// Mounts whose volume is already mounted by the container (or already
    /// declared by the pod) are skipped, so applying the same bindings again
    /// changes nothing.
    pub fn apply(&self, bindings: &BindingSet, pod: &mut Pod, container: usize) -> Planned {
        let mut planned = Planned::default();
        let Some(PodSpec {
            containers,
            volumes,
            init_containers,
            security_context,
            ..
        }) = pod.spec.as_mut()
        else {
            return planned;
        };
        let Some(target) = containers.get_mut(container) else {
            return planned;
        };

        for binding in bindings {
            let volume_id = binding.volume_id.as_str();
            for mount in &binding.mounts {
                if is_mounted(target, volume_id) || is_declared(volumes.as_deref(), volume_id) {
                    debug!(%volume_id, "Volume already mounted");
                    planned.skipped += 1;
                    continue;
                }

                if volume_id.is_empty() || mount.container_dir.is_empty() {
                    warn!(
                        %volume_id,
                        container_dir = %mount.container_dir,
                        "Binding is missing a volume id or container directory"
                    );
                }

                debug!(%volume_id, container_dir = %mount.container_dir, "Mounting volume");
                volumes.get_or_insert_with(Vec::new).push(Volume {
                    name: volume_id.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: volume_id.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                target
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(VolumeMount {
                        name: volume_id.to_string(),
                        mount_path: mount.container_dir.clone(),
                        ..Default::default()
                    });

                if let Policy::InitContainers { owner } = &self.policy {
                    init_containers.get_or_insert_with(Vec::new).push(fixup_container(
                        target,
                        volume_id,
                        &mount.container_dir,
                        owner,
                    ));
                }

                planned.added += 1;
            }
        }

        if let Policy::FsGroup { default_gid } = self.policy {
            if planned.added > 0 {
                let gid = group_id(security_context.as_ref(), target.security_context.as_ref())
                    .unwrap_or(default_gid);
                debug!(gid, "Setting pod group");
                let sc = security_context.get_or_insert_with(PodSecurityContext::default);
                sc.run_as_group.get_or_insert(gid);
                sc.fs_group.get_or_insert(gid);
            }
        }

        planned
    }
}

fn is_mounted(container: &Container, volume_id: &str) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == volume_id)
}

fn is_declared(volumes: Option<&[Volume]>, volume_id: &str) -> bool {
    volumes
        .into_iter()
        .flatten()
        .any(|v| v.name == volume_id)
}

/// Builds a root init container that hands the mount path over to `owner`.
///
/// It shares the target container's image and mounts as they stand once the
/// volume has been mounted.
fn fixup_container(target: &Container, volume_id: &str, path: &str, owner: &str) -> Container {
    Container {
        name: format!("{BINDING_TYPE}-{volume_id}"),
        image: target.image.clone(),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("chown -R {owner} {path}"),
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..Default::default()
        }),
        volume_mounts: target.volume_mounts.clone(),
        ..Default::default()
    }
}

/// Picks the group the pod already runs as, preferring explicit groups over
/// users and pod settings over container settings.
fn group_id(pod: Option<&PodSecurityContext>, container: Option<&SecurityContext>) -> Option<i64> {
    pod.and_then(|sc| sc.run_as_group)
        .or_else(|| container.and_then(|sc| sc.run_as_group))
        .or_else(|| pod.and_then(|sc| sc.fs_group))
        .or_else(|| pod.and_then(|sc| sc.run_as_user))
        .or_else(|| container.and_then(|sc| sc.run_as_user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{MountSpec, ServiceBinding};

    fn app_pod() -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "opi".to_string(),
                    image: Some("eirini/dorini".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn bindings(ids: &[&str], dir: &str) -> BindingSet {
        ids.iter()
            .map(|id| ServiceBinding {
                volume_id: id.to_string(),
                mounts: vec![MountSpec {
                    container_dir: dir.to_string(),
                    ..Default::default()
                }],
            })
            .collect()
    }

    fn spec(pod: &Pod) -> &PodSpec {
        pod.spec.as_ref().unwrap()
    }

    fn mounts(pod: &Pod) -> Vec<(&str, &str)> {
        spec(pod).containers[0]
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| (m.name.as_str(), m.mount_path.as_str()))
            .collect()
    }

    fn volumes(pod: &Pod) -> Vec<(&str, &str)> {
        spec(pod)
            .volumes
            .iter()
            .flatten()
            .map(|v| {
                let claim = v.persistent_volume_claim.as_ref().unwrap();
                (v.name.as_str(), claim.claim_name.as_str())
            })
            .collect()
    }

    #[test]
    fn mounts_single_volume() {
        let mut pod = app_pod();
        let planned = Planner::default().apply(
            &bindings(&["the-volume-id"], "/var/vcap/data/abc"),
            &mut pod,
            0,
        );

        assert_eq!(planned, Planned { added: 1, skipped: 0 });
        assert_eq!(mounts(&pod), vec![("the-volume-id", "/var/vcap/data/abc")]);
        assert_eq!(volumes(&pod), vec![("the-volume-id", "the-volume-id")]);
        assert!(spec(&pod).init_containers.is_none());
        assert!(spec(&pod).security_context.is_none());
    }

    #[test]
    fn preserves_binding_order() {
        let mut pod = app_pod();
        let set = bindings(&["id1", "id2", "id3"], "/var/vcap/data/x");
        Planner::default().apply(&set, &mut pod, 0);

        assert_eq!(
            mounts(&pod),
            vec![
                ("id1", "/var/vcap/data/x"),
                ("id2", "/var/vcap/data/x"),
                ("id3", "/var/vcap/data/x"),
            ]
        );
        assert_eq!(
            volumes(&pod),
            vec![("id1", "id1"), ("id2", "id2"), ("id3", "id3")]
        );
    }

    #[test]
    fn is_idempotent() {
        let set = bindings(&["id1", "id2", "id3"], "/data");
        for policy in [
            Policy::Mounts,
            Policy::InitContainers {
                owner: DEFAULT_OWNER.to_string(),
            },
            Policy::FsGroup {
                default_gid: DEFAULT_GROUP_ID,
            },
        ] {
            let planner = Planner::new(policy.clone());
            let mut once = app_pod();
            planner.apply(&set, &mut once, 0);

            let mut twice = once.clone();
            let planned = planner.apply(&set, &mut twice, 0);
            assert_eq!(planned, Planned { added: 0, skipped: 3 }, "{policy:?}");
            assert_eq!(once, twice, "{policy:?}");
        }
    }

    #[test]
    fn skips_volumes_mounted_in_the_same_pass() {
        let mut pod = app_pod();
        let set = bindings(&["vol", "vol"], "/data");
        let planned = Planner::default().apply(&set, &mut pod, 0);
        assert_eq!(planned, Planned { added: 1, skipped: 1 });
        assert_eq!(volumes(&pod), vec![("vol", "vol")]);
    }

    #[test]
    fn skips_volumes_already_declared_by_the_pod() {
        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().volumes = Some(vec![Volume {
            name: "vol".to_string(),
            ..Default::default()
        }]);
        let planned = Planner::default().apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        assert_eq!(planned, Planned { added: 0, skipped: 1 });
        assert!(mounts(&pod).is_empty());
    }

    #[test]
    fn mounts_only_the_target_container() {
        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().containers.push(Container {
            name: "sidecar".to_string(),
            ..Default::default()
        });
        Planner::default().apply(&bindings(&["vol"], "/data"), &mut pod, 1);

        let spec = spec(&pod);
        assert!(spec.containers[0].volume_mounts.is_none());
        assert_eq!(spec.containers[1].volume_mounts.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn missing_container_is_a_noop() {
        let mut pod = app_pod();
        let planned = Planner::default().apply(&bindings(&["vol"], "/data"), &mut pod, 3);
        assert_eq!(planned, Planned::default());
        assert_eq!(pod, app_pod());
    }

    #[test]
    fn empty_fields_produce_empty_mounts() {
        let mut pod = app_pod();
        let set = Some(ServiceBinding {
            volume_id: String::new(),
            mounts: vec![MountSpec::default()],
        })
        .into_iter()
        .collect::<BindingSet>();
        let planned = Planner::default().apply(&set, &mut pod, 0);
        assert_eq!(planned.added, 1);
        assert_eq!(mounts(&pod), vec![("", "")]);
        assert_eq!(volumes(&pod), vec![("", "")]);
    }

    #[test]
    fn adds_ownership_fixup_per_mount() {
        let mut pod = app_pod();
        let planner = Planner::new(Policy::InitContainers {
            owner: DEFAULT_OWNER.to_string(),
        });
        planner.apply(&bindings(&["id1", "id2"], "/var/vcap/data/x"), &mut pod, 0);

        let spec = spec(&pod);
        let inits = spec.init_containers.as_ref().unwrap();
        assert_eq!(inits.len(), 2);
        for (i, (init, id)) in inits.iter().zip(["id1", "id2"]).enumerate() {
            assert_eq!(init.name, format!("eirini-persi-{id}"));
            assert_eq!(init.image.as_deref(), Some("eirini/dorini"));
            assert_eq!(
                init.command.as_deref().unwrap(),
                ["sh", "-c", "chown -R vcap:vcap /var/vcap/data/x"]
            );
            assert_eq!(
                init.security_context.as_ref().unwrap().run_as_user,
                Some(0)
            );
            assert_eq!(init.volume_mounts.as_ref().unwrap().len(), i + 1);
        }
    }

    #[test]
    fn defaults_group_without_identity() {
        let mut pod = app_pod();
        Planner::new(Policy::FsGroup {
            default_gid: DEFAULT_GROUP_ID,
        })
        .apply(&bindings(&["vol"], "/data"), &mut pod, 0);

        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_group, Some(DEFAULT_GROUP_ID));
        assert_eq!(sc.fs_group, Some(DEFAULT_GROUP_ID));
        assert!(spec(&pod).init_containers.is_none());
    }

    #[test]
    fn derives_group_from_existing_identity() {
        let planner = Planner::new(Policy::FsGroup {
            default_gid: DEFAULT_GROUP_ID,
        });

        // Container user only.
        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().containers[0].security_context = Some(SecurityContext {
            run_as_user: Some(1000),
            ..Default::default()
        });
        planner.apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!((sc.run_as_group, sc.fs_group), (Some(1000), Some(1000)));

        // Pod group wins over container user.
        let mut pod = app_pod();
        {
            let spec = pod.spec.as_mut().unwrap();
            spec.security_context = Some(PodSecurityContext {
                run_as_user: Some(1000),
                run_as_group: Some(3000),
                ..Default::default()
            });
            spec.containers[0].security_context = Some(SecurityContext {
                run_as_user: Some(1500),
                ..Default::default()
            });
        }
        planner.apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!(sc.run_as_user, Some(1000));
        assert_eq!((sc.run_as_group, sc.fs_group), (Some(3000), Some(3000)));
    }

    #[test]
    fn keeps_groups_set_by_the_pod() {
        let planner = Planner::new(Policy::FsGroup {
            default_gid: DEFAULT_GROUP_ID,
        });

        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().security_context = Some(PodSecurityContext {
            run_as_group: Some(3000),
            fs_group: Some(4000),
            ..Default::default()
        });
        planner.apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!((sc.run_as_group, sc.fs_group), (Some(3000), Some(4000)));
        assert_eq!(mounts(&pod), vec![("vol", "/data")]);

        // Only the missing field is filled, from the explicit run group.
        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().security_context = Some(PodSecurityContext {
            run_as_group: Some(3000),
            ..Default::default()
        });
        planner.apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!((sc.run_as_group, sc.fs_group), (Some(3000), Some(3000)));

        // A lone fsGroup becomes the run group.
        let mut pod = app_pod();
        pod.spec.as_mut().unwrap().security_context = Some(PodSecurityContext {
            fs_group: Some(4000),
            ..Default::default()
        });
        planner.apply(&bindings(&["vol"], "/data"), &mut pod, 0);
        let sc = spec(&pod).security_context.as_ref().unwrap();
        assert_eq!((sc.run_as_group, sc.fs_group), (Some(4000), Some(4000)));
    }

    #[test]
    fn group_is_untouched_without_new_mounts() {
        let mut pod = app_pod();
        Planner::new(Policy::FsGroup {
            default_gid: DEFAULT_GROUP_ID,
        })
        .apply(&BindingSet::default(), &mut pod, 0);
        assert_eq!(pod, app_pod());
    }
}
