//! Worker pod driver
//!
//! Every lifecycle phase runs as a worker pod instantiated from the
//! provisioner's evaluated pod template. The driver owns pod identity
//! (deterministic names, so a retried phase adopts the live pod instead of
//! spawning a duplicate), the `/pav` volume plumbing, side-channel file
//! reads, and teardown.

pub mod host;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, info};

use crate::config::PAV_VOLUME_DIR;
use crate::error::Error;
use crate::kube_utils::{synchronously_delete_pod, watch_until};

/// Lifecycle phase a worker pod runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Validation,
    Creation,
    Deletion,
    Staging,
    Unstaging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => f.write_str("validation"),
            Self::Creation => f.write_str("creation"),
            Self::Deletion => f.write_str("deletion"),
            Self::Staging => f.write_str("staging"),
            Self::Unstaging => f.write_str("unstaging"),
        }
    }
}

/// Deterministic name of the worker pod for a provisioning phase of a
/// claim. Retries compute the same name and adopt the live pod.
pub fn provisioning_pod_name(phase: Phase, claim_uid: &str) -> String {
    format!("pav-volume-{phase}-pod-{claim_uid}")
}

/// Deterministic name of the worker pod for a staging phase of a claim
/// mounted by a client pod.
pub fn staging_pod_name(phase: Phase, claim_uid: &str, client_pod_uid: &str) -> String {
    format!("pav-volume-{phase}-pod-{claim_uid}-{client_pod_uid}")
}

/// Name of the `/pav` host directory shared by the staging and unstaging
/// workers of one (claim, client pod) pair.
pub fn stage_volume_name(claim_uid: &str, client_pod_uid: &str) -> String {
    format!("pav-volume-stage-{claim_uid}-{client_pod_uid}")
}

/// Options for instantiating a worker pod from a template.
#[derive(Clone, Debug, Default)]
pub struct WorkerOptions {
    /// Pin the pod to this node.
    pub node_name: Option<String>,
    /// Name of the `/pav` host directory; defaults to the pod name.
    pub volume_name: Option<String>,
    /// Give privileged containers bidirectional propagation on `/pav`, so
    /// mounts they create propagate to the host.
    pub bidirectional_mount_propagation: bool,
    /// Owner reference for the pod. Only valid when the owner lives in the
    /// worker's namespace.
    pub owner: Option<OwnerReference>,
    /// Extra labels recording phase, provisioner, and volume identity.
    pub labels: BTreeMap<String, String>,
}

/// A validated pod template from which worker pods are instantiated.
///
/// Not the same as Kubernetes' PodTemplate: this wraps the evaluated
/// `podTemplate` object of a provisioner phase section.
pub struct WorkerTemplate {
    client: Client,
    template: serde_json::Value,
    namespace: String,
}

impl WorkerTemplate {
    /// Wrap a pod-template object, verifying it by asking the API server to
    /// dry-run instantiate a pod from it. The template is not mutated.
    pub async fn new(client: Client, template: &serde_json::Value) -> Result<Self, Error> {
        let namespace = template
            .pointer("/metadata/namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("default")
            .to_string();

        let mut probe = instantiate(template, None, &WorkerOptions::default(), "probe")?;
        if let Some(metadata) = probe
            .get_mut("metadata")
            .and_then(serde_json::Value::as_object_mut)
        {
            metadata.remove("name");
            metadata.insert("generateName".into(), "pav-worker-".into());
        }

        let api = pod_api(client.clone(), &namespace);
        let obj: DynamicObject = serde_json::from_value(probe)?;

        let params = PostParams {
            dry_run: true,
            ..Default::default()
        };

        match api.create(&params, &obj).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 400 || e.code == 422 => {
                return Err(Error::schema(format!("invalid pod template: {}", e.message)));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            client,
            template: template.clone(),
            namespace,
        })
    }

    /// Namespace that instantiated pods belong to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create a worker pod with the given deterministic name, or adopt the
    /// pod if one with that name already exists.
    pub async fn create(&self, pod_name: &str, options: &WorkerOptions) -> Result<WorkerPod, Error> {
        let volume_name = options.volume_name.as_deref().unwrap_or(pod_name);
        let definition = instantiate(&self.template, Some(volume_name), options, pod_name)?;

        let api = pod_api(self.client.clone(), &self.namespace);
        let obj: DynamicObject = serde_json::from_value(definition)?;

        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                info!(pod = pod_name, namespace = %self.namespace, "created worker pod");
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(pod = pod_name, namespace = %self.namespace, "adopted live worker pod");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(WorkerPod::attach(
            self.client.clone(),
            pod_name,
            &self.namespace,
            Some(volume_name),
        ))
    }
}

/// Build a pod definition from a template.
fn instantiate(
    template: &serde_json::Value,
    volume_name: Option<&str>,
    options: &WorkerOptions,
    pod_name: &str,
) -> Result<serde_json::Value, Error> {
    let mut pod = template.clone();

    let root = pod
        .as_object_mut()
        .ok_or_else(|| Error::schema("pod template must be a mapping"))?;

    root.insert("apiVersion".into(), "v1".into());
    root.insert("kind".into(), "Pod".into());

    let metadata = ensure_object(root, "metadata")?;
    metadata.insert("name".into(), pod_name.into());
    metadata.remove("generateName");

    if let Some(owner) = &options.owner {
        metadata.insert("ownerReferences".into(), serde_json::to_value(vec![owner])?);
    }

    if !options.labels.is_empty() {
        let labels = ensure_object(metadata, "labels")?;
        for (key, value) in &options.labels {
            labels.insert(key.clone(), value.clone().into());
        }
    }

    let spec = ensure_object(root, "spec")?;

    if let Some(node_name) = &options.node_name {
        spec.insert("nodeName".into(), node_name.clone().into());
    }

    spec.entry("restartPolicy").or_insert("Never".into());

    // the /pav volume: a shared emptyDir for the dry-run probe, the
    // per-volume host directory for real workers
    let volume = match volume_name {
        Some(name) => serde_json::json!({
            "name": "pav",
            "hostPath": {
                "path": format!("{PAV_VOLUME_DIR}/{name}"),
                "type": "DirectoryOrCreate",
            },
        }),
        None => serde_json::json!({"name": "pav", "emptyDir": {}}),
    };

    ensure_array(spec, "volumes")?.insert(0, volume);

    for section in ["initContainers", "containers"] {
        let Some(containers) = spec.get_mut(section).and_then(serde_json::Value::as_array_mut)
        else {
            continue;
        };

        for container in containers.iter_mut().filter_map(serde_json::Value::as_object_mut) {
            let privileged = container
                .get("securityContext")
                .and_then(|sc| sc.get("privileged"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);

            let mut mount = serde_json::json!({"name": "pav", "mountPath": "/pav"});
            if options.bidirectional_mount_propagation && privileged {
                mount["mountPropagation"] = "Bidirectional".into();
            }

            ensure_array(container, "volumeMounts")?.insert(0, mount);
        }
    }

    Ok(pod)
}

fn ensure_object<'a>(
    map: &'a mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a mut serde_json::Map<String, serde_json::Value>, Error> {
    map.entry(key)
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()))
        .as_object_mut()
        .ok_or_else(|| Error::schema(format!("pod template field {key:?} must be a mapping")))
}

fn ensure_array<'a>(
    map: &'a mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a mut Vec<serde_json::Value>, Error> {
    let entry = map
        .entry(key)
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if entry.is_null() {
        *entry = serde_json::Value::Array(Vec::new());
    }
    entry
        .as_array_mut()
        .ok_or_else(|| Error::schema(format!("pod template field {key:?} must be a list")))
}

fn pod_api(client: Client, namespace: &str) -> Api<DynamicObject> {
    let ar = ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        plural: "pods".to_string(),
    };
    Api::namespaced_with(client, namespace, &ar)
}

/// A live (or recently live) worker pod and its `/pav` host directory.
pub struct WorkerPod {
    client: Client,
    name: String,
    namespace: String,
    volume_dir: PathBuf,
}

impl WorkerPod {
    /// Reference a worker pod by name. `volume_name` defaults to the pod
    /// name.
    pub fn attach(client: Client, name: &str, namespace: &str, volume_name: Option<&str>) -> Self {
        Self {
            client,
            name: name.to_string(),
            namespace: namespace.to_string(),
            volume_dir: Path::new(PAV_VOLUME_DIR).join(volume_name.unwrap_or(name)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Host path of the pod's `/pav` directory. Only meaningful on the
    /// node the pod runs on.
    pub fn volume_dir(&self) -> &Path {
        &self.volume_dir
    }

    /// Contents of a UTF-8 side-channel file under `/pav`, or None if the
    /// file does not exist or is not a regular file. Must only be called
    /// from the node agent of the pod's node.
    pub fn read_side_channel_file(&self, name: &str) -> Option<String> {
        let path = self.volume_dir.join(name);
        if !path.is_file() {
            return None;
        }
        std::fs::read_to_string(&path).ok()
    }

    /// Wait until the pod is scheduled, returning the node it landed on.
    pub async fn wait_until_scheduled(&self) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        watch_until(&api, &self.name, |pod| {
            Ok(pod.spec.as_ref().and_then(|s| s.node_name.clone()))
        })
        .await
    }

    /// Wait until the pod terminates. Returns true on success, false on
    /// failure.
    pub async fn wait_until_terminated(&self) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        watch_until(&api, &self.name, |pod| {
            Ok(match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Succeeded") => Some(true),
                Some("Failed") => Some(false),
                _ => None,
            })
        })
        .await
    }

    /// Wait until the pod terminates or creates `/pav/ready`. Returns true
    /// if it terminated successfully or signalled readiness, false if it
    /// failed. Must only be called from the node agent of the pod's node.
    pub async fn wait_until_terminated_or_ready(&self) -> Result<bool, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let ready_file = self.volume_dir.join("ready");

        loop {
            let pod = api.get(&self.name).await?;

            match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                Some("Succeeded") => return Ok(true),
                Some("Failed") => return Ok(false),
                _ if ready_file.exists() => return Ok(true),
                _ => {}
            }

            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    /// Delete the pod and tear down its `/pav` host directory, including
    /// any mounts the worker left behind. Must only be called from the node
    /// agent of the pod's node. Ignores the pod no longer existing.
    pub async fn delete(&self) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        synchronously_delete_pod(&api, &self.name).await?;
        host::teardown_volume_dir(&self.volume_dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_template() -> serde_json::Value {
        json!({
            "spec": {
                "containers": [{
                    "name": "work",
                    "image": "busybox",
                    "command": ["sh", "-c", "true"],
                }]
            }
        })
    }

    #[test]
    fn phase_names_are_lowercase() {
        assert_eq!(Phase::Validation.to_string(), "validation");
        assert_eq!(Phase::Unstaging.to_string(), "unstaging");
    }

    #[test]
    fn pod_names_are_deterministic() {
        assert_eq!(
            provisioning_pod_name(Phase::Creation, "uid-1"),
            "pav-volume-creation-pod-uid-1"
        );
        assert_eq!(
            staging_pod_name(Phase::Staging, "uid-1", "uid-2"),
            "pav-volume-staging-pod-uid-1-uid-2"
        );
        assert_eq!(stage_volume_name("uid-1", "uid-2"), "pav-volume-stage-uid-1-uid-2");
    }

    #[test]
    fn instantiation_injects_the_pav_volume_first() {
        let pod = instantiate(
            &sample_template(),
            Some("vol-x"),
            &WorkerOptions::default(),
            "worker-1",
        )
        .unwrap();

        assert_eq!(pod["apiVersion"], "v1");
        assert_eq!(pod["kind"], "Pod");
        assert_eq!(pod["metadata"]["name"], "worker-1");
        assert_eq!(pod["spec"]["restartPolicy"], "Never");

        let volume = &pod["spec"]["volumes"][0];
        assert_eq!(volume["name"], "pav");
        assert_eq!(
            volume["hostPath"]["path"],
            "/var/lib/kubernetes-pav/vol-x"
        );

        let mount = &pod["spec"]["containers"][0]["volumeMounts"][0];
        assert_eq!(mount["name"], "pav");
        assert_eq!(mount["mountPath"], "/pav");
        assert!(mount.get("mountPropagation").is_none());
    }

    #[test]
    fn privileged_containers_get_bidirectional_propagation_on_request() {
        let template = json!({
            "spec": {
                "initContainers": [{"name": "prep", "image": "busybox"}],
                "containers": [{
                    "name": "work",
                    "image": "busybox",
                    "securityContext": {"privileged": true},
                }],
            }
        });

        let options = WorkerOptions {
            bidirectional_mount_propagation: true,
            node_name: Some("node-a".into()),
            ..Default::default()
        };

        let pod = instantiate(&template, Some("vol"), &options, "worker-2").unwrap();

        assert_eq!(pod["spec"]["nodeName"], "node-a");

        // unprivileged init container: plain mount
        let init_mount = &pod["spec"]["initContainers"][0]["volumeMounts"][0];
        assert!(init_mount.get("mountPropagation").is_none());

        // privileged container: bidirectional
        let mount = &pod["spec"]["containers"][0]["volumeMounts"][0];
        assert_eq!(mount["mountPropagation"], "Bidirectional");
    }

    #[test]
    fn existing_mounts_and_volumes_are_preserved_after_the_injected_ones() {
        let template = json!({
            "spec": {
                "containers": [{
                    "name": "work",
                    "image": "busybox",
                    "volumeMounts": [{"name": "data", "mountPath": "/data"}],
                }],
                "volumes": [{"name": "data", "emptyDir": {}}],
            }
        });

        let pod = instantiate(&template, Some("vol"), &WorkerOptions::default(), "w").unwrap();

        let volumes = pod["spec"]["volumes"].as_array().unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[0]["name"], "pav");
        assert_eq!(volumes[1]["name"], "data");

        let mounts = pod["spec"]["containers"][0]["volumeMounts"].as_array().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0]["name"], "pav");
        assert_eq!(mounts[1]["name"], "data");
    }

    #[test]
    fn a_template_restart_policy_is_respected() {
        let template = json!({"spec": {"containers": [], "restartPolicy": "OnFailure"}});
        let pod = instantiate(&template, None, &WorkerOptions::default(), "w").unwrap();
        assert_eq!(pod["spec"]["restartPolicy"], "OnFailure");
    }

    #[test]
    fn labels_and_owner_are_applied() {
        let options = WorkerOptions {
            labels: BTreeMap::from([(
                "pav.kubernetes-pav.io/phase".to_string(),
                "creation".to_string(),
            )]),
            owner: Some(OwnerReference {
                api_version: "v1".into(),
                kind: "Pod".into(),
                name: "client".into(),
                uid: "uid-9".into(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod = instantiate(&sample_template(), None, &options, "w").unwrap();
        assert_eq!(pod["metadata"]["labels"]["pav.kubernetes-pav.io/phase"], "creation");
        assert_eq!(pod["metadata"]["ownerReferences"][0]["uid"], "uid-9");
    }

    #[test]
    fn non_mapping_templates_are_rejected() {
        let err = instantiate(&json!("nope"), None, &WorkerOptions::default(), "w").unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }
}
