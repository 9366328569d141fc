//! Provisioner registry / controller agent
//!
//! Watches PavProvisioner objects and keeps each one's infrastructure
//! bundle in place. A finalizer added at bootstrap time blocks provisioner
//! deletion while any volume still references it; once the last volume
//! goes, the bundle is torn down in reverse order and the finalizer
//! released. The agent also owns the admission webhook: it regenerates the
//! serving certificate on start and replaces the bootstrap reject-all
//! webhook configuration with the real rules.

mod bundle;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use k8s_openapi::api::storage::v1::CSIDriver;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::{
    provisioner_finalizer, provisioner_label, DOMAIN, INTERNAL_NAMESPACE, WEBHOOK_CONFIG_NAME,
    WEBHOOK_SERVICE_NAME,
};
use crate::crd::{PavProvisioner, PavProvisionerStatus, ProvisionerPhase};
use crate::error::Error;
use crate::kube_utils::{atomically_modify, backoff_delay};
use crate::pki::{self, WebhookCertificate};
use crate::schema::{self, Mode};
use crate::webhook;

pub use bundle::{bundle_namespace, render_bundle, Bundle};

/// Reports whether any volume still references a provisioner.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeCounter: Send + Sync {
    async fn volumes_exist(&self, provisioner_name: &str) -> Result<bool, Error>;
}

/// Counts labelled claims and CSI volumes through the Kubernetes API.
pub struct ClusterVolumeCounter {
    client: Client,
}

#[async_trait]
impl VolumeCounter for ClusterVolumeCounter {
    async fn volumes_exist(&self, provisioner_name: &str) -> Result<bool, Error> {
        // claims adopted by the provisioner carry the label from creation
        // until their volume is fully deleted
        let claims: Api<PersistentVolumeClaim> = Api::all(self.client.clone());
        let selector = format!("{}={provisioner_name}", provisioner_label());
        let labelled = claims
            .list_metadata(&ListParams::default().labels(&selector).limit(1))
            .await?;
        if !labelled.items.is_empty() {
            return Ok(true);
        }

        // statically pre-provisioned volumes never had a claim stamped
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let all = volumes.list(&ListParams::default()).await?;
        Ok(all.items.iter().any(|pv| {
            pv.spec
                .as_ref()
                .and_then(|s| s.csi.as_ref())
                .is_some_and(|csi| csi.driver == provisioner_name)
        }))
    }
}

/// Shared state of the registry controller.
pub struct Context {
    pub client: Client,
    /// PaV image the plugin workloads run.
    pub image: String,
    pub volumes: Arc<dyn VolumeCounter>,
    /// Consecutive reconcile failures per provisioner, for backoff.
    attempts: Mutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(client: Client, image: String) -> Self {
        Self {
            client: client.clone(),
            image,
            volumes: Arc::new(ClusterVolumeCounter { client }),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn clear_attempts(&self, name: &str) {
        self.attempts.lock().expect("attempts lock").remove(name);
    }

    fn next_attempt(&self, name: &str) -> u32 {
        let mut attempts = self.attempts.lock().expect("attempts lock");
        let attempt = attempts.entry(name.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        current
    }
}

/// What to do with a provisioner whose deletion was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeletionDecision {
    /// Finalizer already released; nothing left to do.
    Done,
    /// Volumes still reference the provisioner; hold the finalizer.
    Blocked,
    /// No volumes remain; tear down the bundle and release the finalizer.
    Teardown,
}

async fn deletion_decision(
    provisioner: &PavProvisioner,
    volumes: &dyn VolumeCounter,
) -> Result<DeletionDecision, Error> {
    if !provisioner
        .finalizers()
        .contains(&provisioner_finalizer())
    {
        return Ok(DeletionDecision::Done);
    }

    if volumes.volumes_exist(&provisioner.name_any()).await? {
        Ok(DeletionDecision::Blocked)
    } else {
        Ok(DeletionDecision::Teardown)
    }
}

/// Reconcile a PavProvisioner.
#[instrument(skip(provisioner, ctx), fields(provisioner = %provisioner.name_any()))]
pub async fn reconcile(
    provisioner: Arc<PavProvisioner>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = provisioner.name_any();

    let action = if provisioner.metadata.deletion_timestamp.is_some() {
        reconcile_deletion(&provisioner, &ctx).await?
    } else {
        reconcile_active(&provisioner, &ctx).await?
    };

    ctx.clear_attempts(&name);
    Ok(action)
}

async fn reconcile_active(
    provisioner: &PavProvisioner,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = provisioner.name_any();
    let api: Api<PavProvisioner> = Api::all(ctx.client.clone());

    ensure_finalizer(&api, &name).await?;

    // the webhook gates writes, but objects may predate it
    if let Err(e) = schema::validate_provisioner(&provisioner.spec, Mode::Templated) {
        warn!(error = %e, "provisioner spec is invalid");
        patch_status(
            ctx,
            &name,
            PavProvisionerStatus::new(ProvisionerPhase::Bootstrapping, e.to_string()),
        )
        .await?;
        return Ok(Action::await_change());
    }

    apply_bundle(ctx, provisioner).await?;

    let (controller_ready, node_ready) = bundle_readiness(ctx, &name).await?;
    let ready = controller_ready && node_ready;

    let mut status = if ready {
        PavProvisionerStatus::new(ProvisionerPhase::Active, "infrastructure bundle is ready")
    } else {
        PavProvisionerStatus::new(
            ProvisionerPhase::Bootstrapping,
            "waiting for plugin workloads to become ready",
        )
    };
    status.controller_plugin_ready = controller_ready;
    status.node_plugin_ready = node_ready;

    patch_status(ctx, &name, status).await?;

    if ready {
        Ok(Action::requeue(Duration::from_secs(60)))
    } else {
        Ok(Action::requeue(Duration::from_secs(5)))
    }
}

async fn reconcile_deletion(
    provisioner: &PavProvisioner,
    ctx: &Context,
) -> Result<Action, Error> {
    let name = provisioner.name_any();

    match deletion_decision(provisioner, ctx.volumes.as_ref()).await? {
        DeletionDecision::Done => Ok(Action::await_change()),
        DeletionDecision::Blocked => {
            info!("deletion blocked: volumes still reference the provisioner");
            patch_status(
                ctx,
                &name,
                PavProvisionerStatus::new(
                    ProvisionerPhase::Blocked,
                    "deletion blocked while volumes of this provisioner exist",
                ),
            )
            .await?;
            Ok(Action::requeue(Duration::from_secs(10)))
        }
        DeletionDecision::Teardown => {
            delete_bundle(ctx, provisioner).await?;

            let api: Api<PavProvisioner> = Api::all(ctx.client.clone());
            remove_finalizer(&api, &name).await?;

            info!("bundle deleted and finalizer released");
            Ok(Action::await_change())
        }
    }
}

/// Requeue with exponential backoff on reconcile errors.
pub fn error_policy(
    provisioner: Arc<PavProvisioner>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    let name = provisioner.name_any();
    let attempt = ctx.next_attempt(&name);
    let delay = backoff_delay(attempt);

    error!(?error, provisioner = %name, ?delay, "reconciliation failed");
    Action::requeue(delay)
}

async fn ensure_finalizer(api: &Api<PavProvisioner>, name: &str) -> Result<(), Error> {
    let finalizer = provisioner_finalizer();
    atomically_modify(api, name, |p| {
        let finalizers = p.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.contains(&finalizer) {
            finalizers.push(finalizer.clone());
        }
        Ok(())
    })
    .await?;
    Ok(())
}

async fn remove_finalizer(api: &Api<PavProvisioner>, name: &str) -> Result<(), Error> {
    let finalizer = provisioner_finalizer();
    atomically_modify(api, name, |p| {
        if let Some(finalizers) = &mut p.metadata.finalizers {
            finalizers.retain(|f| f != &finalizer);
        }
        Ok(())
    })
    .await?;
    Ok(())
}

async fn patch_status(ctx: &Context, name: &str, status: PavProvisionerStatus) -> Result<(), Error> {
    let api: Api<PavProvisioner> = Api::all(ctx.client.clone());
    api.patch_status(
        name,
        &PatchParams::apply("pav-registry"),
        &Patch::Merge(serde_json::json!({"status": status})),
    )
    .await?;
    Ok(())
}

async fn apply_bundle(ctx: &Context, provisioner: &PavProvisioner) -> Result<(), Error> {
    let bundle = render_bundle(provisioner, &ctx.image)?;
    let namespace = bundle_namespace(&provisioner.name_any());

    apply(Api::<Namespace>::all(ctx.client.clone()), &bundle.namespace).await?;

    for account in &bundle.service_accounts {
        apply(
            Api::<ServiceAccount>::namespaced(ctx.client.clone(), &namespace),
            account,
        )
        .await?;
    }

    for binding in &bundle.cluster_role_bindings {
        apply(Api::<ClusterRoleBinding>::all(ctx.client.clone()), binding).await?;
    }

    apply(
        Api::<Deployment>::namespaced(ctx.client.clone(), &namespace),
        &bundle.controller_deployment,
    )
    .await?;

    apply(
        Api::<DaemonSet>::namespaced(ctx.client.clone(), &namespace),
        &bundle.node_daemonset,
    )
    .await?;

    apply(Api::<CSIDriver>::all(ctx.client.clone()), &bundle.csi_driver).await?;

    Ok(())
}

async fn apply<K>(api: Api<K>, object: &K) -> Result<(), Error>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
{
    let name = object.meta().name.clone().unwrap_or_default();
    api.patch(
        &name,
        &PatchParams::apply("pav-registry").force(),
        &Patch::Apply(object),
    )
    .await?;
    Ok(())
}

async fn delete_bundle(ctx: &Context, provisioner: &PavProvisioner) -> Result<(), Error> {
    let name = provisioner.name_any();
    let namespace = bundle_namespace(&name);

    // reverse creation order
    delete(Api::<CSIDriver>::all(ctx.client.clone()), &name).await?;
    delete(
        Api::<DaemonSet>::namespaced(ctx.client.clone(), &namespace),
        "node-plugin",
    )
    .await?;
    delete(
        Api::<Deployment>::namespaced(ctx.client.clone(), &namespace),
        "controller-plugin",
    )
    .await?;
    for binding in [
        format!("{namespace}-node-plugin"),
        format!("{namespace}-controller-plugin"),
    ] {
        delete(Api::<ClusterRoleBinding>::all(ctx.client.clone()), &binding).await?;
    }
    for account in ["pav-node-plugin", "pav-controller-plugin"] {
        delete(
            Api::<ServiceAccount>::namespaced(ctx.client.clone(), &namespace),
            account,
        )
        .await?;
    }
    delete(Api::<Namespace>::all(ctx.client.clone()), &namespace).await?;

    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn bundle_readiness(ctx: &Context, name: &str) -> Result<(bool, bool), Error> {
    let namespace = bundle_namespace(name);

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let controller_ready = deployments
        .get_opt("controller-plugin")
        .await?
        .and_then(|d| d.status)
        .map(|s| s.ready_replicas.unwrap_or(0) >= 1)
        .unwrap_or(false);

    let daemonsets: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let node_ready = daemonsets
        .get_opt("node-plugin")
        .await?
        .and_then(|d| d.status)
        .map(|s| s.number_ready >= s.desired_number_scheduled)
        .unwrap_or(false);

    Ok((controller_ready, node_ready))
}

/// Replace the bootstrap reject-all webhook configuration with the real
/// rules and the freshly generated CA bundle.
pub async fn install_webhook_configuration(
    client: &Client,
    certificate: &WebhookCertificate,
) -> Result<(), Error> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let configuration: ValidatingWebhookConfiguration = serde_json::from_value(serde_json::json!({
        "apiVersion": "admissionregistration.k8s.io/v1",
        "kind": "ValidatingWebhookConfiguration",
        "metadata": {"name": WEBHOOK_CONFIG_NAME},
        "webhooks": [{
            "name": format!("validate.{DOMAIN}"),
            "admissionReviewVersions": ["v1"],
            "sideEffects": "None",
            "failurePolicy": "Fail",
            "clientConfig": {
                "service": {
                    "name": WEBHOOK_SERVICE_NAME,
                    "namespace": INTERNAL_NAMESPACE,
                    "path": "/validate",
                    "port": 443,
                },
                "caBundle": STANDARD.encode(certificate.cert_pem.as_bytes()),
            },
            "rules": [{
                "apiGroups": [DOMAIN],
                "apiVersions": ["v1alpha1"],
                "operations": ["CREATE", "UPDATE"],
                "resources": ["pavprovisioners"],
                "scope": "Cluster",
            }],
        }],
    }))?;

    let api: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    apply_with_manager(&api, WEBHOOK_CONFIG_NAME, &configuration).await
}

async fn apply_with_manager(
    api: &Api<ValidatingWebhookConfiguration>,
    name: &str,
    configuration: &ValidatingWebhookConfiguration,
) -> Result<(), Error> {
    api.patch(
        name,
        &PatchParams::apply("pav-registry").force(),
        &Patch::Apply(configuration),
    )
    .await?;
    Ok(())
}

/// Run the controller agent: webhook first, then the registry controller,
/// until shutdown.
pub async fn run(client: Client, image: String, webhook_addr: SocketAddr) -> Result<(), Error> {
    let certificate =
        pki::generate_webhook_certificate(WEBHOOK_SERVICE_NAME, INTERNAL_NAMESPACE)?;

    install_webhook_configuration(&client, &certificate).await?;
    info!("validating webhook configuration installed");

    let webhook_server = tokio::spawn(async move {
        if let Err(e) = webhook::serve(webhook_addr, &certificate).await {
            error!(error = %e, "webhook server failed");
        }
    });

    let provisioners: Api<PavProvisioner> = Api::all(client.clone());
    let ctx = Arc::new(Context::new(client, image));

    info!("starting PavProvisioner controller");
    Controller::new(provisioners, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    webhook_server.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn provisioner(finalizers: Vec<String>) -> PavProvisioner {
        let spec = serde_json::from_value(json!({
            "provisioningModes": ["Dynamic"],
            "volumeCreation": {"capacity": "1Gi"},
            "volumeStaging": {"podTemplate": {}}
        }))
        .unwrap();

        PavProvisioner {
            metadata: ObjectMeta {
                name: Some("hello".into()),
                uid: Some("uid-hello".into()),
                finalizers: Some(finalizers),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[tokio::test]
    async fn deletion_is_blocked_while_volumes_exist() {
        let mut volumes = MockVolumeCounter::new();
        volumes.expect_volumes_exist().returning(|_| Ok(true));

        let p = provisioner(vec![provisioner_finalizer()]);
        let decision = deletion_decision(&p, &volumes).await.unwrap();
        assert_eq!(decision, DeletionDecision::Blocked);
    }

    #[tokio::test]
    async fn deletion_tears_down_once_volumes_are_gone() {
        let mut volumes = MockVolumeCounter::new();
        volumes.expect_volumes_exist().returning(|_| Ok(false));

        let p = provisioner(vec![provisioner_finalizer()]);
        let decision = deletion_decision(&p, &volumes).await.unwrap();
        assert_eq!(decision, DeletionDecision::Teardown);
    }

    #[tokio::test]
    async fn deletion_without_the_finalizer_is_already_done() {
        let volumes = MockVolumeCounter::new();

        let p = provisioner(vec!["something-else".into()]);
        let decision = deletion_decision(&p, &volumes).await.unwrap();
        assert_eq!(decision, DeletionDecision::Done);
    }

    #[tokio::test]
    async fn volume_lookup_failures_propagate() {
        let mut volumes = MockVolumeCounter::new();
        volumes
            .expect_volumes_exist()
            .returning(|_| Err(Error::internal("list failed")));

        let p = provisioner(vec![provisioner_finalizer()]);
        assert!(deletion_decision(&p, &volumes).await.is_err());
    }

}
