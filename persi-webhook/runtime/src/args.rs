use crate::{
    admission::Admission,
    core::{plan, Engine, IdentitySchema, Planner, Policy},
    k8s,
    metrics::AdmissionMetrics,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "persi-webhook",
    about = "Mounts bound persistent volumes into application pods"
)]
pub struct Args {
    #[clap(long, default_value = "persi=info,warn", env = "PERSI_WEBHOOK_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    // kubert's runtime always holds an API client; these only select its kubeconfig.
    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Labels that identify application pods, as `key=value[,key=value]`.
    ///
    /// Pods that do not match are admitted unchanged.
    #[clap(
        long,
        default_value = "source_type=APP",
        env = "PERSI_WEBHOOK_APP_SELECTOR"
    )]
    app_selector: k8s::Selector,

    /// Where a binding's volume id is read from (`credentials` or `device`).
    #[clap(long, default_value = "credentials", env = "PERSI_WEBHOOK_BINDING_SCHEMA")]
    binding_schema: IdentitySchema,

    /// Changes made alongside each mounted volume.
    #[clap(
        long,
        value_enum,
        default_value = "mounts",
        env = "PERSI_WEBHOOK_MOUNT_POLICY"
    )]
    mount_policy: MountPolicy,

    /// The `user:group` given ownership of mount paths by init containers.
    #[clap(long, default_value = plan::DEFAULT_OWNER)]
    fixup_owner: String,

    /// The group id applied when a pod runs without a user or group.
    #[clap(long, default_value_t = plan::DEFAULT_GROUP_ID)]
    default_group_id: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum MountPolicy {
    /// Add volumes and mounts only.
    Mounts,

    /// Add an ownership fix-up init container per mount.
    InitContainers,

    /// Set the pod's `runAsGroup` and `fsGroup`.
    FsGroup,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            app_selector,
            binding_schema,
            mount_policy,
            fixup_owner,
            default_group_id,
        } = self;

        let engine = Engine::new(
            binding_schema,
            Planner::new(mount_policy.into_policy(fixup_owner, default_group_id)),
        );

        let mut prom = Registry::with_prefix("persi");
        let metrics = AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        info!(
            %app_selector,
            %binding_schema,
            policy = ?engine.planner().policy(),
            "Volume admission webhook configured"
        );
        let admission = Admission::new(engine, app_selector, metrics);
        let runtime = runtime.spawn_server(admission);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

impl MountPolicy {
    fn into_policy(self, owner: String, default_gid: i64) -> Policy {
        match self {
            Self::Mounts => Policy::Mounts,
            Self::InitContainers => Policy::InitContainers { owner },
            Self::FsGroup => Policy::FsGroup { default_gid },
        }
    }
}
