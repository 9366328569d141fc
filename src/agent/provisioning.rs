//! Volume validation, creation, and deletion
//!
//! The provisioning state machine lives in an annotation on the claim. The
//! controller agent ([`Role::Controller`]) owns the launch states: it
//! evaluates the phase templates, runs the admission filters, submits
//! worker pods, and pins the machine to the node each pod landed on. The
//! node agent ([`Role::Node`]) owns the await and remove states, which read
//! the worker's `/pav` side-channel files from the node's host directory.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use tracing::{info, warn};

use crate::config::{
    deletion_requested_annotation, delete_volume_finalizer, handler_node_label,
    provisioner_label, state_annotation, storage_class_annotation, AGENT_RETRY_DELAY, DOMAIN,
    PHASE_TIMEOUT,
};
use crate::crd::{AccessMode, PavProvisioner, VolumeMode};
use crate::error::Error;
use crate::kube_utils::{atomically_modify, backoff_delay};
use crate::quantity::{parse_quantity, Rounding};
use crate::states::{ProvisioningState, RpcCode};
use crate::template::{
    ProvisionerTemplates, ProvisioningContext, TemplateEngine, VolumeCreationConfig,
    VolumeValidationConfig,
};
use crate::worker::{provisioning_pod_name, Phase, WorkerOptions, WorkerPod, WorkerTemplate};

use super::WorkPool;

/// Which half of the provisioning machine this process drives.
#[derive(Clone, Debug)]
pub enum Role {
    /// Launch states: evaluate templates and submit worker pods.
    Controller,
    /// Await/remove states pinned to this node's `/pav` directories.
    Node(String),
}

/// Watch labelled claims and drive their machines until the process exits.
/// Restarts the watch after internal failures.
pub async fn run(client: Client, role: Role) -> Result<(), Error> {
    loop {
        if let Err(e) = watch_claims(&client, &role).await {
            warn!(error = %e, "provisioning watch failed, restarting");
            tokio::time::sleep(AGENT_RETRY_DELAY).await;
        }
    }
}

async fn watch_claims(client: &Client, role: &Role) -> Result<(), Error> {
    let mut selector = provisioner_label();
    if let Role::Node(node_name) = role {
        selector = format!("{selector},{}={node_name}", handler_node_label());
    }

    let api: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let pool: Arc<WorkPool<String, PersistentVolumeClaim>> = Arc::new(WorkPool::new());

    let mut stream = watcher(api, watcher::Config::default().labels(&selector)).boxed();

    while let Some(event) = stream
        .try_next()
        .await
        .map_err(|e| Error::internal(format!("claim watch: {e}")))?
    {
        match event {
            watcher::Event::Apply(pvc) | watcher::Event::InitApply(pvc) => {
                let Some(uid) = pvc.uid() else { continue };
                if pool.update(uid.clone(), pvc) {
                    let client = client.clone();
                    let role = role.clone();
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move {
                        drive_claim(client, role, pool, uid).await;
                    });
                }
            }
            watcher::Event::Delete(pvc) => {
                if let Some(uid) = pvc.uid() {
                    pool.remove(&uid);
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    Err(Error::internal("claim watch ended unexpectedly"))
}

/// Drain state transitions for one claim, exiting once nothing changed.
async fn drive_claim(
    client: Client,
    role: Role,
    pool: Arc<WorkPool<String, PersistentVolumeClaim>>,
    uid: String,
) {
    let mut previous: Option<String> = None;
    let mut attempt = 0;

    loop {
        let Some((pvc, generation)) = pool.get(&uid) else {
            pool.finish(&uid);
            return;
        };

        let fingerprint = claim_fingerprint(&pvc);
        if previous.as_ref() == Some(&fingerprint) {
            if pool.try_finish(&uid, generation) {
                return;
            }
            continue;
        }

        match step(&client, &role, &pvc).await {
            Ok(()) => {
                previous = Some(fingerprint);
                attempt = 0;
            }
            Err(e) => {
                warn!(claim = %uid, error = %e, "provisioning step failed, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// The parts of a claim a step reacts to.
fn claim_fingerprint(pvc: &PersistentVolumeClaim) -> String {
    format!(
        "{}|{}|{}",
        pvc.annotations()
            .get(&state_annotation())
            .map(String::as_str)
            .unwrap_or(""),
        pvc.meta().deletion_timestamp.is_some(),
        pvc.annotations()
            .contains_key(&deletion_requested_annotation()),
    )
}

async fn step(client: &Client, role: &Role, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
    if matches!(role, Role::Controller)
        && pvc.meta().deletion_timestamp.is_some()
        && !pvc
            .annotations()
            .contains_key(&deletion_requested_annotation())
    {
        return request_deletion(client, pvc).await;
    }

    let Some(state_json) = pvc.annotations().get(&state_annotation()) else {
        return Ok(());
    };
    let state = ProvisioningState::from_json(state_json)
        .map_err(|e| Error::internal(format!("unparsable state annotation: {e}")))?;

    if !handles(role, &state) {
        return Ok(());
    }

    info!(claim = %pvc.name_any(), state = ?state, "running provisioning handler");

    let ctx = StepContext::load(client.clone(), pvc.clone()).await?;

    match state {
        ProvisioningState::LaunchValidationPod => ctx.launch_validation().await,
        ProvisioningState::LaunchCreationPod => ctx.launch_creation().await,
        ProvisioningState::LaunchDeletionPod => ctx.launch_deletion(None).await,
        ProvisioningState::LaunchDeletionPodAfterFailure {
            error_code,
            error_details,
        } => ctx.launch_deletion(Some((error_code, error_details))).await,
        ProvisioningState::AwaitValidationPod {
            validation_pod_namespace,
        } => {
            ctx.await_validation(role_node(role), validation_pod_namespace)
                .await
        }
        ProvisioningState::RemoveValidationPod {
            validation_pod_namespace,
        } => {
            ctx.remove_validation(validation_pod_namespace, None).await
        }
        ProvisioningState::RemoveValidationPodAfterFailure {
            validation_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.remove_validation(validation_pod_namespace, Some((error_code, error_details)))
                .await
        }
        ProvisioningState::AwaitCreationPod {
            creation_pod_namespace,
            handle,
            capacity,
        } => {
            ctx.await_creation(role_node(role), creation_pod_namespace, handle, capacity)
                .await
        }
        ProvisioningState::RemoveCreationPod {
            creation_pod_namespace,
            handle,
            capacity,
        } => {
            ctx.remove_creation(creation_pod_namespace, Ok((handle, capacity)))
                .await
        }
        ProvisioningState::RemoveCreationPodAfterFailure {
            creation_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.remove_creation(creation_pod_namespace, Err((error_code, error_details)))
                .await
        }
        ProvisioningState::AwaitDeletionPod {
            deletion_pod_namespace,
        } => {
            ctx.await_deletion(role_node(role), deletion_pod_namespace, None)
                .await
        }
        ProvisioningState::AwaitDeletionPodAfterFailure {
            deletion_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.await_deletion(
                role_node(role),
                deletion_pod_namespace,
                Some((error_code, error_details)),
            )
            .await
        }
        ProvisioningState::RemoveDeletionPod {
            deletion_pod_namespace,
        } => ctx.remove_deletion(deletion_pod_namespace, None).await,
        ProvisioningState::RemoveDeletionPodAfterFailure {
            deletion_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.remove_deletion(deletion_pod_namespace, Some((error_code, error_details)))
                .await
        }
        ProvisioningState::Created { .. }
        | ProvisioningState::Deleted
        | ProvisioningState::CreationFailed { .. }
        | ProvisioningState::UnrecoverableFailure { .. } => Ok(()),
    }
}

fn handles(role: &Role, state: &ProvisioningState) -> bool {
    let launch = matches!(
        state,
        ProvisioningState::LaunchValidationPod
            | ProvisioningState::LaunchCreationPod
            | ProvisioningState::LaunchDeletionPod
            | ProvisioningState::LaunchDeletionPodAfterFailure { .. }
    );
    let terminal = matches!(
        state,
        ProvisioningState::Created { .. }
            | ProvisioningState::Deleted
            | ProvisioningState::CreationFailed { .. }
            | ProvisioningState::UnrecoverableFailure { .. }
    );

    match role {
        Role::Controller => launch,
        Role::Node(_) => !launch && !terminal,
    }
}

fn role_node(role: &Role) -> Option<&str> {
    match role {
        Role::Controller => None,
        Role::Node(node_name) => Some(node_name),
    }
}

/// Mark the claim for deletion and collapse a finished machine into its
/// deletion arm. In-flight machines pick the marker up when they next
/// reach `Created` or `CreationFailed`.
async fn request_deletion(client: &Client, pvc: &PersistentVolumeClaim) -> Result<(), Error> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(
        client.clone(),
        &pvc.namespace()
            .ok_or_else(|| Error::internal("claim has no namespace"))?,
    );

    atomically_modify(&api, &pvc.name_any(), |pvc| {
        let state = pvc
            .annotations()
            .get(&state_annotation())
            .and_then(|json| ProvisioningState::from_json(json).ok());

        let annotations = pvc.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(deletion_requested_annotation(), String::new());

        match state {
            Some(ProvisioningState::Created { .. }) => {
                annotations.insert(
                    state_annotation(),
                    ProvisioningState::LaunchDeletionPod.to_json(),
                );
            }
            Some(ProvisioningState::CreationFailed { .. }) => {
                annotations.insert(state_annotation(), ProvisioningState::Deleted.to_json());
                if let Some(finalizers) = &mut pvc.metadata.finalizers {
                    finalizers.retain(|f| f != &delete_volume_finalizer());
                }
            }
            _ => {}
        }

        Ok(())
    })
    .await?;

    Ok(())
}

/// Advance the machine, applying the collapse rules for a concurrently
/// requested deletion, and move the handler-node pin.
async fn set_state(
    client: &Client,
    pvc: &PersistentVolumeClaim,
    state: ProvisioningState,
    handler_node: Option<&str>,
) -> Result<(), Error> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(
        client.clone(),
        &pvc.namespace()
            .ok_or_else(|| Error::internal("claim has no namespace"))?,
    );

    atomically_modify(&api, &pvc.name_any(), |pvc| {
        let deletion_requested = pvc
            .annotations()
            .contains_key(&deletion_requested_annotation());

        let mut new_state = state.clone();
        let mut drop_finalizer = false;

        match &new_state {
            ProvisioningState::Created { .. } if deletion_requested => {
                new_state = ProvisioningState::LaunchDeletionPod;
            }
            ProvisioningState::CreationFailed { .. } => {
                drop_finalizer = true;
                if deletion_requested {
                    new_state = ProvisioningState::Deleted;
                }
            }
            ProvisioningState::Deleted => {
                drop_finalizer = true;
            }
            _ => {}
        }

        if drop_finalizer {
            if let Some(finalizers) = &mut pvc.metadata.finalizers {
                finalizers.retain(|f| f != &delete_volume_finalizer());
            }
        }

        pvc.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(state_annotation(), new_state.to_json());

        let labels = pvc.metadata.labels.get_or_insert_with(Default::default);
        match handler_node {
            None => {
                labels.remove(&handler_node_label());
            }
            Some(node_name) => {
                labels.insert(handler_node_label(), node_name.to_string());
            }
        }

        Ok(())
    })
    .await?;

    Ok(())
}

/// One claim's machine plus everything its handlers evaluate against.
struct StepContext {
    client: Client,
    provisioner: PavProvisioner,
    pvc: PersistentVolumeClaim,
    sc: StorageClass,
}

impl StepContext {
    async fn load(client: Client, pvc: PersistentVolumeClaim) -> Result<Self, Error> {
        // the storage class may be deleted before the claim, so the copy
        // snapshotted at creation time is authoritative
        let sc_json = pvc
            .annotations()
            .get(&storage_class_annotation())
            .ok_or_else(|| Error::internal("claim has no storage class annotation"))?;
        let sc: StorageClass = serde_json::from_str(sc_json)
            .map_err(|e| Error::serialization(format!("stored storage class: {e}")))?;

        let provisioners: Api<PavProvisioner> = Api::all(client.clone());
        let provisioner = provisioners.get(&sc.provisioner).await?;

        Ok(Self {
            client,
            provisioner,
            pvc,
            sc,
        })
    }

    fn pvc_uid(&self) -> String {
        self.pvc.uid().unwrap_or_default()
    }

    fn engine(&self) -> TemplateEngine {
        TemplateEngine::with_client(self.client.clone())
    }

    fn worker_options(&self, phase: Phase) -> WorkerOptions {
        WorkerOptions {
            labels: [
                (format!("{DOMAIN}/phase"), phase.to_string()),
                (
                    provisioner_label(),
                    self.provisioner.name_any(),
                ),
            ]
            .into(),
            ..Default::default()
        }
    }

    async fn launch_validation(&self) -> Result<(), Error> {
        let context = ProvisioningContext::validation(&self.pvc, &self.sc)?;
        let engine = self.engine();
        let templates = ProvisionerTemplates::new(&self.provisioner, &engine);

        let config = match templates.eval_validation_config(&context) {
            Ok(config) => config,
            Err(e) => return self.fail_creation(RpcCode::InvalidArgument, e.to_string()).await,
        };

        if let Err(reason) = check_requested_properties(&config, &context) {
            return self.fail_creation(RpcCode::InvalidArgument, reason).await;
        }

        let Some(template) = &config.pod_template else {
            return set_state(
                &self.client,
                &self.pvc,
                ProvisioningState::LaunchCreationPod,
                None,
            )
            .await;
        };

        let template = match WorkerTemplate::new(self.client.clone(), template).await {
            Ok(template) => template,
            Err(e) if is_config_error(&e) => {
                return self
                    .fail_creation(RpcCode::InvalidArgument, e.to_string())
                    .await;
            }
            Err(e) => return Err(e),
        };
        let pod = template
            .create(
                &provisioning_pod_name(Phase::Validation, &self.pvc_uid()),
                &self.worker_options(Phase::Validation),
            )
            .await?;
        let node_name = pod.wait_until_scheduled().await?;

        set_state(
            &self.client,
            &self.pvc,
            ProvisioningState::AwaitValidationPod {
                validation_pod_namespace: template.namespace().to_string(),
            },
            Some(&node_name),
        )
        .await
    }

    async fn await_validation(
        &self,
        node_name: Option<&str>,
        namespace: String,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Validation, &self.pvc_uid()),
            &namespace,
            None,
        );

        let outcome = wait_terminated(&pod, Phase::Validation).await?;

        let state = match outcome {
            Ok(()) => ProvisioningState::RemoveValidationPod {
                validation_pod_namespace: namespace,
            },
            Err(details) => ProvisioningState::RemoveValidationPodAfterFailure {
                validation_pod_namespace: namespace,
                error_code: RpcCode::InvalidArgument,
                error_details: format!("validation pod failed: {details}"),
            },
        };

        set_state(&self.client, &self.pvc, state, node_name).await
    }

    async fn remove_validation(
        &self,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Validation, &self.pvc_uid()),
            &namespace,
            None,
        );
        pod.delete().await?;

        let state = match failure {
            None => ProvisioningState::LaunchCreationPod,
            Some((error_code, error_details)) => ProvisioningState::CreationFailed {
                error_code,
                error_details,
            },
        };

        set_state(&self.client, &self.pvc, state, None).await
    }

    async fn launch_creation(&self) -> Result<(), Error> {
        let context = ProvisioningContext::creation_deletion(&self.pvc, &self.sc)?;
        let engine = self.engine();
        let templates = ProvisionerTemplates::new(&self.provisioner, &engine);

        let config = match templates.eval_creation_config(&context) {
            Ok(config) => config,
            Err(e) => return self.fail_creation(RpcCode::InvalidArgument, e.to_string()).await,
        };

        let Some(template) = &config.pod_template else {
            // no worker to run: the evaluated fields are the whole result
            return match creation_outcome_without_worker(&config, &context) {
                Ok((handle, capacity)) => {
                    set_state(
                        &self.client,
                        &self.pvc,
                        ProvisioningState::Created { handle, capacity },
                        None,
                    )
                    .await
                }
                Err(reason) => self.fail_creation(RpcCode::InvalidArgument, reason).await,
            };
        };

        let template = match WorkerTemplate::new(self.client.clone(), template).await {
            Ok(template) => template,
            Err(e) if is_config_error(&e) => {
                return self
                    .fail_creation(RpcCode::InvalidArgument, e.to_string())
                    .await;
            }
            Err(e) => return Err(e),
        };
        let pod = template
            .create(
                &provisioning_pod_name(Phase::Creation, &self.pvc_uid()),
                &self.worker_options(Phase::Creation),
            )
            .await?;
        let node_name = pod.wait_until_scheduled().await?;

        set_state(
            &self.client,
            &self.pvc,
            ProvisioningState::AwaitCreationPod {
                creation_pod_namespace: template.namespace().to_string(),
                handle: config.handle,
                capacity: config.capacity,
            },
            Some(&node_name),
        )
        .await
    }

    async fn await_creation(
        &self,
        node_name: Option<&str>,
        namespace: String,
        handle: Option<String>,
        capacity: Option<i64>,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Creation, &self.pvc_uid()),
            &namespace,
            None,
        );

        let fail = |details: String| ProvisioningState::RemoveCreationPodAfterFailure {
            creation_pod_namespace: namespace.clone(),
            error_code: RpcCode::InvalidArgument,
            error_details: format!("creation pod failed: {details}"),
        };

        let state = match wait_terminated(&pod, Phase::Creation).await? {
            Err(details) => fail(details),
            Ok(()) => {
                let handle_file = pod.read_side_channel_file("handle");
                let capacity_file = pod.read_side_channel_file("capacity");
                match resolve_creation_result(
                    handle,
                    capacity,
                    handle_file,
                    capacity_file,
                    &self.pvc_uid(),
                ) {
                    Ok((handle, capacity)) => ProvisioningState::RemoveCreationPod {
                        creation_pod_namespace: namespace.clone(),
                        handle,
                        capacity,
                    },
                    Err(reason) => fail(reason),
                }
            }
        };

        set_state(&self.client, &self.pvc, state, node_name).await
    }

    async fn remove_creation(
        &self,
        namespace: String,
        outcome: Result<(String, i64), (RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Creation, &self.pvc_uid()),
            &namespace,
            None,
        );
        pod.delete().await?;

        let state = match outcome {
            Ok((handle, capacity)) => ProvisioningState::Created { handle, capacity },
            // roll back: synthesise the deletion phase before surfacing
            Err((error_code, error_details)) => {
                ProvisioningState::LaunchDeletionPodAfterFailure {
                    error_code,
                    error_details,
                }
            }
        };

        set_state(&self.client, &self.pvc, state, None).await
    }

    async fn launch_deletion(&self, failure: Option<(RpcCode, String)>) -> Result<(), Error> {
        let context = ProvisioningContext::creation_deletion(&self.pvc, &self.sc)?;
        let engine = self.engine();
        let templates = ProvisionerTemplates::new(&self.provisioner, &engine);

        let config = match templates.eval_deletion_config(&context) {
            Ok(config) => config,
            Err(e) => {
                return set_state(
                    &self.client,
                    &self.pvc,
                    ProvisioningState::UnrecoverableFailure {
                        error_code: RpcCode::Internal,
                        error_details: e.to_string(),
                    },
                    None,
                )
                .await;
            }
        };

        let Some(template) = &config.pod_template else {
            let state = match failure {
                None => ProvisioningState::Deleted,
                Some((error_code, error_details)) => ProvisioningState::CreationFailed {
                    error_code,
                    error_details,
                },
            };
            return set_state(&self.client, &self.pvc, state, None).await;
        };

        let template = match WorkerTemplate::new(self.client.clone(), template).await {
            Ok(template) => template,
            Err(e) if is_config_error(&e) => {
                return set_state(
                    &self.client,
                    &self.pvc,
                    ProvisioningState::UnrecoverableFailure {
                        error_code: RpcCode::Internal,
                        error_details: e.to_string(),
                    },
                    None,
                )
                .await;
            }
            Err(e) => return Err(e),
        };
        let pod = template
            .create(
                &provisioning_pod_name(Phase::Deletion, &self.pvc_uid()),
                &self.worker_options(Phase::Deletion),
            )
            .await?;
        let node_name = pod.wait_until_scheduled().await?;

        let namespace = template.namespace().to_string();
        let state = match failure {
            None => ProvisioningState::AwaitDeletionPod {
                deletion_pod_namespace: namespace,
            },
            Some((error_code, error_details)) => {
                ProvisioningState::AwaitDeletionPodAfterFailure {
                    deletion_pod_namespace: namespace,
                    error_code,
                    error_details,
                }
            }
        };

        set_state(&self.client, &self.pvc, state, Some(&node_name)).await
    }

    async fn await_deletion(
        &self,
        node_name: Option<&str>,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Deletion, &self.pvc_uid()),
            &namespace,
            None,
        );

        let state = match wait_terminated(&pod, Phase::Deletion).await? {
            // a failed deletion parks the volume for operator repair
            Err(details) => ProvisioningState::UnrecoverableFailure {
                error_code: RpcCode::Internal,
                error_details: format!("deletion pod failed: {details}"),
            },
            Ok(()) => match failure {
                None => ProvisioningState::RemoveDeletionPod {
                    deletion_pod_namespace: namespace,
                },
                Some((error_code, error_details)) => {
                    ProvisioningState::RemoveDeletionPodAfterFailure {
                        deletion_pod_namespace: namespace,
                        error_code,
                        error_details,
                    }
                }
            },
        };

        set_state(&self.client, &self.pvc, state, node_name).await
    }

    async fn remove_deletion(
        &self,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = WorkerPod::attach(
            self.client.clone(),
            &provisioning_pod_name(Phase::Deletion, &self.pvc_uid()),
            &namespace,
            None,
        );
        pod.delete().await?;

        let state = match failure {
            None => ProvisioningState::Deleted,
            Some((error_code, error_details)) => ProvisioningState::CreationFailed {
                error_code,
                error_details,
            },
        };

        set_state(&self.client, &self.pvc, state, None).await
    }

    async fn fail_creation(&self, error_code: RpcCode, error_details: String) -> Result<(), Error> {
        set_state(
            &self.client,
            &self.pvc,
            ProvisioningState::CreationFailed {
                error_code,
                error_details,
            },
            None,
        )
        .await
    }
}

/// Wait for a worker pod, reading its `/pav/error` on failure. A timeout
/// counts as a failure of the phase.
async fn wait_terminated(pod: &WorkerPod, phase: Phase) -> Result<Result<(), String>, Error> {
    match tokio::time::timeout(PHASE_TIMEOUT, pod.wait_until_terminated()).await {
        Err(_) => Ok(Err(Error::Timeout(phase).to_string())),
        Ok(Ok(true)) => Ok(Ok(())),
        Ok(Ok(false)) => {
            let details = pod
                .read_side_channel_file("error")
                .unwrap_or_default()
                .trim()
                .to_string();
            Ok(Err(details))
        }
        Ok(Err(e)) => Err(e),
    }
}

/// Schema and template errors are the provisioner author's fault; they
/// fail the phase instead of being retried.
fn is_config_error(error: &Error) -> bool {
    matches!(error, Error::Schema(_) | Error::Template(_))
}

/// The admission filters of `spec.volumeValidation`.
fn check_requested_properties(
    config: &VolumeValidationConfig,
    context: &ProvisioningContext,
) -> Result<(), String> {
    let requested_mode: VolumeMode = context
        .requested_volume_mode
        .parse()
        .map_err(|e: Error| e.to_string())?;
    if !config.volume_modes.contains(&requested_mode) {
        return Err(format!("volume mode {requested_mode} is not allowed"));
    }

    for mode in &context.requested_access_modes {
        let mode: AccessMode = mode.parse().map_err(|e: Error| e.to_string())?;
        if !config.access_modes.contains(&mode) {
            return Err(format!("access mode {mode} is not allowed"));
        }
    }

    if context.requested_min_capacity < config.min_capacity {
        return Err(format!(
            "requested capacity {} is below the provisioner minimum {}",
            context.requested_min_capacity, config.min_capacity
        ));
    }

    if let Some(max_capacity) = config.max_capacity {
        if context.requested_min_capacity > max_capacity {
            return Err(format!(
                "requested capacity {} exceeds the provisioner maximum {max_capacity}",
                context.requested_min_capacity
            ));
        }
        if let Some(requested_max) = context.requested_max_capacity {
            if requested_max > max_capacity {
                return Err(format!(
                    "requested capacity limit {requested_max} exceeds the provisioner \
                     maximum {max_capacity}"
                ));
            }
        }
    }

    Ok(())
}

/// Creation without a worker pod: the evaluated fields decide everything.
fn creation_outcome_without_worker(
    config: &VolumeCreationConfig,
    context: &ProvisioningContext,
) -> Result<(String, i64), String> {
    let handle = config
        .handle
        .clone()
        .or_else(|| context.default_handle.clone())
        .ok_or_else(|| "no volume handle available".to_string())?;

    let capacity = config
        .capacity
        .ok_or_else(|| "'spec.volumeCreation.capacity' is required without a pod template".to_string())?;

    Ok((handle, capacity))
}

/// Combine the evaluated fields with the worker's side-channel files: the
/// field wins, the file is the fallback, the claim UID names the default
/// handle, and capacity must come from somewhere.
fn resolve_creation_result(
    handle_field: Option<String>,
    capacity_field: Option<i64>,
    handle_file: Option<String>,
    capacity_file: Option<String>,
    pvc_uid: &str,
) -> Result<(String, i64), String> {
    let handle = match (handle_field, handle_file) {
        (Some(handle), _) => handle,
        (None, Some(file)) => {
            let file = file.trim().to_string();
            if file.is_empty() {
                return Err("specified empty handle in file /pav/handle".to_string());
            }
            file
        }
        (None, None) => format!("pvc-{pvc_uid}"),
    };

    let capacity = match (capacity_field, capacity_file) {
        (Some(capacity), _) => capacity,
        (None, Some(file)) => parse_quantity(file.trim(), Rounding::Floor)
            .map_err(|e| format!("specified invalid capacity in file /pav/capacity: {e}"))?,
        (None, None) => {
            return Err(
                "creation pod didn't specify volume capacity in file /pav/capacity".to_string(),
            )
        }
    };

    Ok((handle, capacity))
}
