use crate::{BINDING_TYPE, VCAP_SERVICES};
use persi_webhook_k8s_api::Pod;
use serde::Deserialize;

/// The volume bindings declared by a pod, in payload order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingSet(Vec<ServiceBinding>);

/// A single persistent volume binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceBinding {
    /// Names both the pod volume and the claim that backs it.
    pub volume_id: String,
    pub mounts: Vec<MountSpec>,
}

/// Where a binding's volume is mounted.
///
/// The device type and mode are carried through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MountSpec {
    pub container_dir: String,
    pub device_type: String,
    pub mode: String,
}

/// Determines where a binding's volume id is read from.
///
/// A deployment uses exactly one schema.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IdentitySchema {
    /// `credentials.volume_id` on each binding.
    #[default]
    Credentials,

    /// `device.volume_id` on each of a binding's volume mounts.
    Device,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid VCAP_SERVICES payload: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

#[derive(Debug, thiserror::Error)]
#[error("unknown binding schema: {0:?} (expected `credentials` or `device`)")]
pub struct InvalidSchema(String);

// Every level is optional: `null` decodes to the empty value.
#[derive(Debug, Default, Deserialize)]
struct VcapService {
    credentials: Option<VolumeRef>,
    volume_mounts: Option<Vec<Option<VcapVolumeMount>>>,
}

#[derive(Debug, Default, Deserialize)]
struct VcapVolumeMount {
    container_dir: Option<String>,
    device_type: Option<String>,
    mode: Option<String>,
    device: Option<VolumeRef>,
}

#[derive(Debug, Deserialize)]
struct VolumeRef {
    volume_id: Option<String>,
}

/// Finds the first container, in declaration order, that sets
/// `VCAP_SERVICES`, returning its index and the variable's value.
///
/// A variable without a literal value yields an empty payload.
pub fn find(pod: &Pod) -> Option<(usize, &str)> {
    let spec = pod.spec.as_ref()?;
    spec.containers.iter().enumerate().find_map(|(idx, c)| {
        let var = c.env.iter().flatten().find(|e| e.name == VCAP_SERVICES)?;
        Some((idx, var.value.as_deref().unwrap_or_default()))
    })
}

/// Decodes the bindings of the handled type from a `VCAP_SERVICES` payload.
///
/// The payload must be a JSON object or `null`. Bindings of other types are
/// ignored, so a payload without the binding type decodes to an empty set.
/// A `null` service or volume mount is treated as one with no fields set.
pub fn decode(payload: &str, schema: IdentitySchema) -> Result<BindingSet, DecodeError> {
    let mut types = serde_json::from_str::<Option<serde_json::Map<String, serde_json::Value>>>(
        payload,
    )?
    .unwrap_or_default();
    let services = match types.remove(BINDING_TYPE) {
        Some(services) => serde_json::from_value::<Option<Vec<Option<VcapService>>>>(services)?,
        None => None,
    };
    Ok(schema.extract(
        services
            .into_iter()
            .flatten()
            .map(Option::unwrap_or_default)
            .collect(),
    ))
}

// === impl BindingSet ===

impl BindingSet {
    pub fn iter(&self) -> std::slice::Iter<'_, ServiceBinding> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ServiceBinding> for BindingSet {
    fn from_iter<T: IntoIterator<Item = ServiceBinding>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a BindingSet {
    type Item = &'a ServiceBinding;
    type IntoIter = std::slice::Iter<'a, ServiceBinding>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// === impl IdentitySchema ===

impl IdentitySchema {
    /// Resolves each service's volume identity.
    ///
    /// Under the device schema every mount carries its own identity, so each
    /// mount becomes a binding of its own.
    fn extract(self, services: Vec<VcapService>) -> BindingSet {
        match self {
            Self::Credentials => services
                .into_iter()
                .map(|svc| ServiceBinding {
                    volume_id: svc
                        .credentials
                        .and_then(|c| c.volume_id)
                        .unwrap_or_default(),
                    mounts: svc
                        .volume_mounts
                        .into_iter()
                        .flatten()
                        .map(|mount| MountSpec::from(mount.unwrap_or_default()))
                        .collect(),
                })
                .collect(),

            Self::Device => services
                .into_iter()
                .flat_map(|svc| svc.volume_mounts.into_iter().flatten())
                .map(|mount| mount.unwrap_or_default())
                .map(|mut mount| ServiceBinding {
                    volume_id: mount
                        .device
                        .take()
                        .and_then(|d| d.volume_id)
                        .unwrap_or_default(),
                    mounts: vec![MountSpec::from(mount)],
                })
                .collect(),
        }
    }
}

impl std::str::FromStr for IdentitySchema {
    type Err = InvalidSchema;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("credentials") {
            return Ok(Self::Credentials);
        }
        if s.eq_ignore_ascii_case("device") {
            return Ok(Self::Device);
        }
        Err(InvalidSchema(s.to_string()))
    }
}

impl std::fmt::Display for IdentitySchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credentials => f.write_str("credentials"),
            Self::Device => f.write_str("device"),
        }
    }
}

// === impl MountSpec ===

impl From<VcapVolumeMount> for MountSpec {
    fn from(mount: VcapVolumeMount) -> Self {
        Self {
            container_dir: mount.container_dir.unwrap_or_default(),
            device_type: mount.device_type.unwrap_or_default(),
            mode: mount.mode.unwrap_or_default(),
        }
    }
}
