//! Volume staging and unstaging
//!
//! One staging state machine runs per (client pod, claim) pair, stored in
//! annotations on the client pod and keyed by the claim UID. The node agent
//! on the pod's node drives every state: it evaluates the staging template,
//! runs the worker pinned to its node with bidirectional `/pav`
//! propagation, validates the produced `/pav/volume`, and bind-mounts it
//! onto kubelet's publish target. Unstaging reverses all of it, optionally
//! through an unstaging worker.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node as KubeNode, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use regex::Regex;
use tracing::{info, warn};

use crate::config::{
    staging_pvc_name_annotation, staging_pvc_namespace_annotation, staging_read_only_annotation,
    staging_state_annotation, staging_target_path_annotation, unstage_volume_finalizer,
    unstaging_requested_annotation, uses_volumes_label, AGENT_RETRY_DELAY, DOMAIN, PHASE_TIMEOUT,
};
use crate::crd::PavProvisioner;
use crate::error::Error;
use crate::kube_utils::{atomically_modify, backoff_delay};
use crate::quantity::{parse_quantity, Rounding};
use crate::states::{RpcCode, StagingState};
use crate::template::{ProvisionerTemplates, StagingContext, TemplateEngine};
use crate::worker::{
    host, stage_volume_name, staging_pod_name, Phase, WorkerOptions, WorkerPod, WorkerTemplate,
};

use super::WorkPool;

fn machine_annotation_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"^{}/([0-9a-fA-F]{{8}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{4}}-[0-9a-fA-F]{{12}})-",
            regex::escape(DOMAIN)
        ))
        .expect("pattern is valid")
    })
}

/// Watch this node's client pods and drive their staging machines until
/// the process exits. Restarts the watch after internal failures.
pub async fn run(client: Client, node_name: String) -> Result<(), Error> {
    loop {
        if let Err(e) = watch_pods(&client, &node_name).await {
            warn!(error = %e, "staging watch failed, restarting");
            tokio::time::sleep(AGENT_RETRY_DELAY).await;
        }
    }
}

async fn watch_pods(client: &Client, node_name: &str) -> Result<(), Error> {
    let api: Api<Pod> = Api::all(client.clone());
    let pool: Arc<WorkPool<(String, String), Pod>> = Arc::new(WorkPool::new());

    let config = watcher::Config::default()
        .labels(&uses_volumes_label())
        .fields(&format!("spec.nodeName={node_name}"));
    let mut stream = watcher(api, config).boxed();

    while let Some(event) = stream
        .try_next()
        .await
        .map_err(|e| Error::internal(format!("pod watch: {e}")))?
    {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let Some(pod_uid) = pod.uid() else { continue };

                let pattern = machine_annotation_pattern();
                let pvc_uids: std::collections::HashSet<String> = pod
                    .annotations()
                    .keys()
                    .filter_map(|key| Some(pattern.captures(key)?[1].to_string()))
                    .collect();

                for pvc_uid in pvc_uids {
                    let key = (pod_uid.clone(), pvc_uid.clone());
                    if pool.update(key.clone(), pod.clone()) {
                        let client = client.clone();
                        let node_name = node_name.to_string();
                        let pool = Arc::clone(&pool);
                        tokio::spawn(async move {
                            drive_stage(client, node_name, pool, key).await;
                        });
                    }
                }
            }
            watcher::Event::Delete(pod) => {
                if let Some(pod_uid) = pod.uid() {
                    let pattern = machine_annotation_pattern();
                    for key in pod.annotations().keys() {
                        if let Some(captures) = pattern.captures(key) {
                            pool.remove(&(pod_uid.clone(), captures[1].to_string()));
                        }
                    }
                }
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    Err(Error::internal("pod watch ended unexpectedly"))
}

/// Drain staging transitions for one (pod, claim) pair.
async fn drive_stage(
    client: Client,
    node_name: String,
    pool: Arc<WorkPool<(String, String), Pod>>,
    key: (String, String),
) {
    let mut previous: Option<String> = None;
    let mut attempt = 0;

    loop {
        let Some((pod, generation)) = pool.get(&key) else {
            pool.finish(&key);
            return;
        };

        let fingerprint = stage_fingerprint(&pod, &key.1);
        if previous.as_ref() == Some(&fingerprint) {
            if pool.try_finish(&key, generation) {
                return;
            }
            continue;
        }

        match step(&client, &node_name, &pod, &key.1).await {
            Ok(()) => {
                previous = Some(fingerprint);
                attempt = 0;
            }
            Err(e) => {
                warn!(pod = %key.0, claim = %key.1, error = %e, "staging step failed, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn stage_fingerprint(pod: &Pod, pvc_uid: &str) -> String {
    format!(
        "{}|{}",
        pod.annotations()
            .get(&staging_state_annotation(pvc_uid))
            .map(String::as_str)
            .unwrap_or(""),
        pod.annotations()
            .contains_key(&unstaging_requested_annotation(pvc_uid)),
    )
}

async fn step(client: &Client, node_name: &str, pod: &Pod, pvc_uid: &str) -> Result<(), Error> {
    let Some(state_json) = pod.annotations().get(&staging_state_annotation(pvc_uid)) else {
        return Ok(());
    };
    let state = StagingState::from_json(state_json)
        .map_err(|e| Error::internal(format!("unparsable state annotation: {e}")))?;

    if matches!(
        state,
        StagingState::Staged { .. }
            | StagingState::Unstaged
            | StagingState::StagingFailed { .. }
            | StagingState::UnrecoverableFailure { .. }
    ) {
        return Ok(());
    }

    info!(pod = %pod.name_any(), claim = %pvc_uid, state = ?state, "running staging handler");

    let ctx = StageContext::load(client.clone(), pod.clone(), pvc_uid, node_name).await?;

    match state {
        StagingState::LaunchStagingPod => ctx.launch_staging().await,
        StagingState::AwaitStagingPod {
            staging_pod_namespace,
        } => ctx.await_staging(staging_pod_namespace).await,
        StagingState::RemoveStagingPod {
            staging_pod_namespace,
        } => ctx.remove_staging(staging_pod_namespace, None).await,
        StagingState::RemoveStagingPodAfterFailure {
            staging_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.remove_staging(staging_pod_namespace, Some((error_code, error_details)))
                .await
        }
        StagingState::LaunchUnstagingPod => ctx.launch_unstaging(None).await,
        StagingState::LaunchUnstagingPodAfterFailure {
            error_code,
            error_details,
        } => ctx.launch_unstaging(Some((error_code, error_details))).await,
        StagingState::AwaitUnstagingPod {
            unstaging_pod_namespace,
        } => ctx.await_unstaging(unstaging_pod_namespace, None).await,
        StagingState::AwaitUnstagingPodAfterFailure {
            unstaging_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.await_unstaging(unstaging_pod_namespace, Some((error_code, error_details)))
                .await
        }
        StagingState::RemoveUnstagingPod {
            unstaging_pod_namespace,
        } => ctx.remove_unstaging(unstaging_pod_namespace, None).await,
        StagingState::RemoveUnstagingPodAfterFailure {
            unstaging_pod_namespace,
            error_code,
            error_details,
        } => {
            ctx.remove_unstaging(unstaging_pod_namespace, Some((error_code, error_details)))
                .await
        }
        StagingState::Staged { .. }
        | StagingState::Unstaged
        | StagingState::StagingFailed { .. }
        | StagingState::UnrecoverableFailure { .. } => Ok(()),
    }
}

/// Advance the machine, applying the collapse rules for a concurrently
/// requested unstage.
async fn set_state(
    client: &Client,
    client_pod: &Pod,
    pvc_uid: &str,
    state: StagingState,
) -> Result<(), Error> {
    let api: Api<Pod> = Api::namespaced(
        client.clone(),
        &client_pod
            .namespace()
            .ok_or_else(|| Error::internal("pod has no namespace"))?,
    );
    let pvc_uid = pvc_uid.to_string();

    atomically_modify(&api, &client_pod.name_any(), |pod| {
        let unstaging_requested = pod
            .annotations()
            .contains_key(&unstaging_requested_annotation(&pvc_uid));

        let mut new_state = state.clone();
        let mut drop_finalizer = false;

        match &new_state {
            StagingState::Staged {
                staging_pod_namespace,
            } if unstaging_requested => {
                new_state = StagingState::RemoveStagingPod {
                    staging_pod_namespace: staging_pod_namespace.clone(),
                };
            }
            StagingState::StagingFailed { .. } => {
                drop_finalizer = true;
                if unstaging_requested {
                    new_state = StagingState::Unstaged;
                }
            }
            StagingState::Unstaged => {
                drop_finalizer = true;
            }
            _ => {}
        }

        if drop_finalizer {
            if let Some(finalizers) = &mut pod.metadata.finalizers {
                finalizers.retain(|f| f != &unstage_volume_finalizer(&pvc_uid));
            }
        }

        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(staging_state_annotation(&pvc_uid), new_state.to_json());

        Ok(())
    })
    .await?;

    Ok(())
}

/// One staging machine plus everything its handlers evaluate against.
struct StageContext {
    client: Client,
    provisioner: PavProvisioner,
    pvc: PersistentVolumeClaim,
    pv: PersistentVolume,
    node: KubeNode,
    client_pod: Pod,
    pvc_uid: String,
    node_name: String,
    target_path: PathBuf,
    read_only: bool,
}

impl StageContext {
    async fn load(
        client: Client,
        client_pod: Pod,
        pvc_uid: &str,
        node_name: &str,
    ) -> Result<Self, Error> {
        let annotation = |key: String| {
            client_pod
                .annotations()
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::internal(format!("pod is missing annotation {key}")))
        };

        let pvc_name = annotation(staging_pvc_name_annotation(pvc_uid))?;
        let pvc_namespace = annotation(staging_pvc_namespace_annotation(pvc_uid))?;
        let target_path = PathBuf::from(annotation(staging_target_path_annotation(pvc_uid))?);
        let read_only = annotation(staging_read_only_annotation(pvc_uid))? == "true";

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &pvc_namespace);
        let pvc = pvcs.get(&pvc_name).await?;

        let volume_name = pvc
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .ok_or_else(|| Error::internal("claim is not bound to a volume"))?;
        let pvs: Api<PersistentVolume> = Api::all(client.clone());
        let pv = pvs.get(&volume_name).await?;

        let driver = pv
            .spec
            .as_ref()
            .and_then(|s| s.csi.as_ref())
            .map(|csi| csi.driver.clone())
            .ok_or_else(|| Error::internal("volume has no CSI source"))?;
        let provisioners: Api<PavProvisioner> = Api::all(client.clone());
        let provisioner = provisioners.get(&driver).await?;

        let nodes: Api<KubeNode> = Api::all(client.clone());
        let node = nodes.get(node_name).await?;

        Ok(Self {
            client,
            provisioner,
            pvc,
            pv,
            node,
            client_pod,
            pvc_uid: pvc_uid.to_string(),
            node_name: node_name.to_string(),
            target_path,
            read_only,
        })
    }

    fn staging_context(&self) -> Result<StagingContext, Error> {
        StagingContext::new(&self.pvc, &self.pv, &self.node, self.read_only)
    }

    fn worker_pod(&self, phase: Phase, namespace: &str) -> WorkerPod {
        let client_pod_uid = self.client_pod.uid().unwrap_or_default();
        WorkerPod::attach(
            self.client.clone(),
            &staging_pod_name(phase, &self.pvc_uid, &client_pod_uid),
            namespace,
            Some(&stage_volume_name(&self.pvc_uid, &client_pod_uid)),
        )
    }

    fn worker_options(&self, phase: Phase, template_namespace: &str) -> WorkerOptions {
        let client_pod_uid = self.client_pod.uid().unwrap_or_default();

        // a namespaced owner must live in the dependent's namespace
        let owner = (self.client_pod.namespace().as_deref() == Some(template_namespace)).then(
            || k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                name: self.client_pod.name_any(),
                uid: client_pod_uid.clone(),
                ..Default::default()
            },
        );

        WorkerOptions {
            node_name: Some(self.node_name.clone()),
            volume_name: Some(stage_volume_name(&self.pvc_uid, &client_pod_uid)),
            bidirectional_mount_propagation: true,
            owner,
            labels: [
                (format!("{DOMAIN}/phase"), phase.to_string()),
                (
                    format!("{DOMAIN}/provisioner"),
                    self.provisioner.name_any(),
                ),
            ]
            .into(),
        }
    }

    async fn set_state(&self, state: StagingState) -> Result<(), Error> {
        set_state(&self.client, &self.client_pod, &self.pvc_uid, state).await
    }

    async fn launch_staging(&self) -> Result<(), Error> {
        let config = match self
            .staging_context()
            .and_then(|context| {
                let engine = TemplateEngine::with_client(self.client.clone());
                ProvisionerTemplates::new(&self.provisioner, &engine).eval_staging_config(&context)
            }) {
            Ok(config) => config,
            Err(e) => {
                return self
                    .set_state(StagingState::StagingFailed {
                        error_code: RpcCode::InvalidArgument,
                        error_details: e.to_string(),
                    })
                    .await;
            }
        };

        let template = match WorkerTemplate::new(self.client.clone(), &config.pod_template).await
        {
            Ok(template) => template,
            Err(e) if is_config_error(&e) => {
                return self
                    .set_state(StagingState::StagingFailed {
                        error_code: RpcCode::InvalidArgument,
                        error_details: e.to_string(),
                    })
                    .await;
            }
            Err(e) => return Err(e),
        };
        let client_pod_uid = self.client_pod.uid().unwrap_or_default();

        match template
            .create(
                &staging_pod_name(Phase::Staging, &self.pvc_uid, &client_pod_uid),
                &self.worker_options(Phase::Staging, template.namespace()),
            )
            .await
        {
            Ok(_) => {
                self.set_state(StagingState::AwaitStagingPod {
                    staging_pod_namespace: template.namespace().to_string(),
                })
                .await
            }
            Err(e) => {
                self.set_state(StagingState::RemoveStagingPodAfterFailure {
                    staging_pod_namespace: template.namespace().to_string(),
                    error_code: RpcCode::InvalidArgument,
                    error_details: e.to_string(),
                })
                .await
            }
        }
    }

    async fn await_staging(&self, namespace: String) -> Result<(), Error> {
        let pod = self.worker_pod(Phase::Staging, &namespace);

        let fail = |details: String| StagingState::RemoveStagingPodAfterFailure {
            staging_pod_namespace: namespace.clone(),
            error_code: RpcCode::InvalidArgument,
            error_details: format!("staging pod failed: {details}"),
        };

        // staging pods may keep running after signalling /pav/ready, so
        // this wait has no time bound
        if !pod.wait_until_terminated_or_ready().await? {
            let details = pod
                .read_side_channel_file("error")
                .unwrap_or_default()
                .trim()
                .to_string();
            return self.set_state(fail(details)).await;
        }

        match self.resolve_and_publish(&pod).await {
            Ok(()) => {
                self.set_state(StagingState::Staged {
                    staging_pod_namespace: namespace,
                })
                .await
            }
            Err(reason) => self.set_state(fail(reason)).await,
        }
    }

    /// Validate `/pav/volume` and bind it onto the publish target.
    async fn resolve_and_publish(&self, pod: &WorkerPod) -> Result<(), String> {
        let volume_dir = pod.volume_dir();

        let volume_path = std::fs::canonicalize(volume_dir.join("volume"))
            .map_err(|e| format!("error resolving /pav/volume: {e}"))?;

        if !path_is_under(&volume_path, volume_dir) {
            return Err("/pav/volume resolves to a path outside /pav".to_string());
        }

        let volume_mode = self
            .pv
            .spec
            .as_ref()
            .and_then(|s| s.volume_mode.as_deref())
            .unwrap_or("Filesystem");

        match volume_mode {
            "Filesystem" => {
                if !volume_path.is_dir() {
                    return Err("/pav/volume must resolve to a directory".to_string());
                }
            }
            _ => {
                if !is_block_device(&volume_path) {
                    return Err("/pav/volume must resolve to a block special file".to_string());
                }

                let expected = self
                    .pv
                    .spec
                    .as_ref()
                    .and_then(|s| s.capacity.as_ref())
                    .and_then(|c| c.get("storage"))
                    .map(|q| parse_quantity(&q.0, Rounding::HalfEven))
                    .transpose()
                    .map_err(|e| e.to_string())?
                    .unwrap_or(0);
                let actual =
                    host::block_device_size(&volume_path).map_err(|e| e.to_string())?;
                if actual != expected {
                    return Err(format!(
                        "block device at /pav/volume has size {actual}, should be {expected}"
                    ));
                }
            }
        }

        host::bind_mount(&volume_path, &self.target_path)
            .await
            .map_err(|e| e.to_string())
    }

    async fn remove_staging(
        &self,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = self.worker_pod(Phase::Staging, &namespace);
        pod.delete().await?;

        host::unmount_target(&self.target_path).await?;

        let state = match failure {
            None => StagingState::LaunchUnstagingPod,
            Some((error_code, error_details)) => StagingState::LaunchUnstagingPodAfterFailure {
                error_code,
                error_details,
            },
        };
        self.set_state(state).await
    }

    async fn launch_unstaging(&self, failure: Option<(RpcCode, String)>) -> Result<(), Error> {
        let config = match self
            .staging_context()
            .and_then(|context| {
                let engine = TemplateEngine::with_client(self.client.clone());
                ProvisionerTemplates::new(&self.provisioner, &engine)
                    .eval_unstaging_config(&context)
            }) {
            Ok(config) => config,
            Err(e) => {
                return self
                    .set_state(StagingState::UnrecoverableFailure {
                        error_code: RpcCode::Internal,
                        error_details: e.to_string(),
                    })
                    .await;
            }
        };

        let Some(template) = &config.pod_template else {
            let state = match failure {
                None => StagingState::Unstaged,
                Some((error_code, error_details)) => StagingState::StagingFailed {
                    error_code,
                    error_details,
                },
            };
            return self.set_state(state).await;
        };

        let template = match WorkerTemplate::new(self.client.clone(), template).await {
            Ok(template) => template,
            Err(e) if is_config_error(&e) => {
                return self
                    .set_state(StagingState::UnrecoverableFailure {
                        error_code: RpcCode::Internal,
                        error_details: e.to_string(),
                    })
                    .await;
            }
            Err(e) => return Err(e),
        };
        let client_pod_uid = self.client_pod.uid().unwrap_or_default();

        match template
            .create(
                &staging_pod_name(Phase::Unstaging, &self.pvc_uid, &client_pod_uid),
                &self.worker_options(Phase::Unstaging, template.namespace()),
            )
            .await
        {
            Ok(_) => {
                let namespace = template.namespace().to_string();
                let state = match failure {
                    None => StagingState::AwaitUnstagingPod {
                        unstaging_pod_namespace: namespace,
                    },
                    Some((error_code, error_details)) => {
                        StagingState::AwaitUnstagingPodAfterFailure {
                            unstaging_pod_namespace: namespace,
                            error_code,
                            error_details,
                        }
                    }
                };
                self.set_state(state).await
            }
            Err(e) => {
                self.set_state(StagingState::UnrecoverableFailure {
                    error_code: RpcCode::Internal,
                    error_details: e.to_string(),
                })
                .await
            }
        }
    }

    async fn await_unstaging(
        &self,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = self.worker_pod(Phase::Unstaging, &namespace);

        let terminated =
            tokio::time::timeout(PHASE_TIMEOUT, pod.wait_until_terminated()).await;

        let succeeded = match terminated {
            Err(_) => false,
            Ok(result) => result?,
        };

        if !succeeded {
            let details = pod
                .read_side_channel_file("error")
                .unwrap_or_default()
                .trim()
                .to_string();
            // a failed unstaging parks the volume for operator repair
            return self
                .set_state(StagingState::UnrecoverableFailure {
                    error_code: RpcCode::Internal,
                    error_details: format!("unstaging pod failed: {details}"),
                })
                .await;
        }

        let state = match failure {
            None => StagingState::RemoveUnstagingPod {
                unstaging_pod_namespace: namespace,
            },
            Some((error_code, error_details)) => StagingState::RemoveUnstagingPodAfterFailure {
                unstaging_pod_namespace: namespace,
                error_code,
                error_details,
            },
        };
        self.set_state(state).await
    }

    async fn remove_unstaging(
        &self,
        namespace: String,
        failure: Option<(RpcCode, String)>,
    ) -> Result<(), Error> {
        let pod = self.worker_pod(Phase::Unstaging, &namespace);
        pod.delete().await?;

        let state = match failure {
            None => StagingState::Unstaged,
            Some((error_code, error_details)) => StagingState::StagingFailed {
                error_code,
                error_details,
            },
        };
        self.set_state(state).await
    }
}

/// Schema and template errors are the provisioner author's fault; they
/// fail the phase instead of being retried.
fn is_config_error(error: &Error) -> bool {
    matches!(error, Error::Schema(_) | Error::Template(_))
}

fn path_is_under(path: &Path, directory: &Path) -> bool {
    path != directory && path.starts_with(directory)
}

fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_machine_annotation_pattern_extracts_claim_uids() {
        let pattern = machine_annotation_pattern();

        let key = format!("{DOMAIN}/11111111-2222-3333-4444-555555555555-state");
        assert_eq!(
            &pattern.captures(&key).unwrap()[1],
            "11111111-2222-3333-4444-555555555555"
        );

        let key = format!("{DOMAIN}/11111111-2222-3333-4444-555555555555-read-only");
        assert!(pattern.captures(&key).is_some());

        assert!(pattern.captures(&format!("{DOMAIN}/state")).is_none());
        assert!(pattern
            .captures("other.example.org/11111111-2222-3333-4444-555555555555-state")
            .is_none());
    }

    #[test]
    fn volume_paths_must_stay_under_the_pav_directory() {
        let dir = Path::new("/var/lib/kubernetes-pav/vol-1");

        assert!(path_is_under(
            Path::new("/var/lib/kubernetes-pav/vol-1/volume"),
            dir
        ));
        assert!(path_is_under(
            Path::new("/var/lib/kubernetes-pav/vol-1/deep/volume"),
            dir
        ));
        assert!(!path_is_under(dir, dir));
        assert!(!path_is_under(Path::new("/var/lib/kubernetes-pav"), dir));
        assert!(!path_is_under(Path::new("/etc/passwd"), dir));
        // a sibling whose name shares the prefix is outside
        assert!(!path_is_under(
            Path::new("/var/lib/kubernetes-pav/vol-10/volume"),
            dir
        ));
    }

    #[test]
    fn stage_fingerprints_react_to_state_and_unstage_requests() {
        let mut pod = Pod::default();
        let uid = "11111111-2222-3333-4444-555555555555";

        let initial = stage_fingerprint(&pod, uid);

        pod.metadata.annotations = Some(
            [(
                staging_state_annotation(uid),
                StagingState::LaunchStagingPod.to_json(),
            )]
            .into(),
        );
        let with_state = stage_fingerprint(&pod, uid);
        assert_ne!(initial, with_state);

        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(unstaging_requested_annotation(uid), String::new());
        assert_ne!(with_state, stage_fingerprint(&pod, uid));
    }
}
