//! End-to-end exercises of the provisioner pipeline that need no cluster:
//! admission validation, template evaluation, and phase config parsing for
//! a realistic "hello world" provisioner.

use std::collections::BTreeMap;

use serde_json::json;

use pav::crd::{AccessMode, PavProvisioner, PavProvisionerSpec, VolumeMode};
use pav::schema::{validate_provisioner, Mode};
use pav::states::{ProvisioningState, RpcCode, StagingState};
use pav::template::{
    ProvisionerTemplates, ProvisioningContext, StagingContext, TemplateEngine,
};

fn hello_world_provisioner() -> PavProvisioner {
    let spec: PavProvisionerSpec = serde_json::from_value(json!({
        "provisioningModes": ["Dynamic"],
        "volumeCreation": {
            "capacity": "{{ requestedMinCapacity }}",
        },
        "volumeStaging": {
            "podTemplate": {
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "stage",
                        "image": "docker.io/library/busybox:1.36",
                        "command": [
                            "sh", "-c",
                            "mkdir /pav/volume && \
                             echo 'Hello world!' > /pav/volume/greeting && \
                             echo {{ pvc.metadata.name | tobash }} > /pav/volume/pvc-name",
                        ],
                    }],
                }
            }
        }
    }))
    .expect("hello world spec should deserialize");

    PavProvisioner {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("hello-world".into()),
            uid: Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee".into()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

fn claim_context() -> ProvisioningContext {
    ProvisioningContext {
        requested_volume_mode: "Filesystem".into(),
        requested_access_modes: vec!["ReadOnlyMany".into()],
        requested_min_capacity: 1 << 30,
        requested_max_capacity: None,
        params: BTreeMap::new(),
        sc: json!({"metadata": {"name": "hello-world"}, "provisioner": "hello-world"}),
        pvc: json!({"metadata": {"name": "my claim", "namespace": "default"}}),
        default_handle: Some("pvc-11111111-2222-3333-4444-555555555555".into()),
    }
}

#[test]
fn the_hello_world_provisioner_passes_admission() {
    validate_provisioner(&hello_world_provisioner().spec, Mode::Templated)
        .expect("admission should accept the provisioner");
}

#[test]
fn admission_rejects_it_once_creation_is_claimed_without_dynamic_mode() {
    let mut provisioner = hello_world_provisioner();
    provisioner.spec.provisioning_modes = vec![pav::crd::ProvisioningMode::Static];

    assert!(validate_provisioner(&provisioner.spec, Mode::Templated).is_err());
}

#[test]
fn validation_falls_back_to_permissive_defaults() {
    let provisioner = hello_world_provisioner();
    let engine = TemplateEngine::new();
    let templates = ProvisionerTemplates::new(&provisioner, &engine);

    let config = templates
        .eval_validation_config(&claim_context())
        .expect("validation config should evaluate");

    assert!(config.volume_modes.contains(&VolumeMode::Filesystem));
    assert_eq!(config.access_modes.len(), AccessMode::ALL.len());
    assert_eq!(config.min_capacity, 1);
    assert!(config.pod_template.is_none());
}

#[test]
fn creation_capacity_tracks_the_requested_capacity() {
    let provisioner = hello_world_provisioner();
    let engine = TemplateEngine::new();
    let templates = ProvisionerTemplates::new(&provisioner, &engine);

    let config = templates
        .eval_creation_config(&claim_context())
        .expect("creation config should evaluate");

    // no worker pod: the evaluated capacity field is the volume capacity
    assert_eq!(config.capacity, Some(1 << 30));
    assert!(config.pod_template.is_none());
    assert!(config.handle.is_none());
}

#[test]
fn the_staging_template_embeds_the_claim_name_as_a_shell_token() {
    let provisioner = hello_world_provisioner();
    let engine = TemplateEngine::new();
    let templates = ProvisionerTemplates::new(&provisioner, &engine);

    let context = StagingContext {
        volume_mode: "Filesystem".into(),
        access_modes: vec!["ReadOnlyMany".into()],
        capacity: 1 << 30,
        params: BTreeMap::new(),
        handle: "pvc-11111111-2222-3333-4444-555555555555".into(),
        read_only: true,
        pvc: json!({"metadata": {"name": "my claim", "namespace": "default"}}),
        pv: json!({"metadata": {"name": "pv-1"}}),
        node: json!({"metadata": {"name": "node-a"}}),
    };

    let config = templates
        .eval_staging_config(&context)
        .expect("staging config should evaluate");

    let command = config.pod_template["spec"]["containers"][0]["command"][2]
        .as_str()
        .expect("command should be a string");

    // the claim name round-trips through the shell unharmed
    assert!(command.contains("echo 'my claim' > /pav/volume/pvc-name"));
    assert!(command.contains("Hello world!"));
}

#[test]
fn evaluation_is_deterministic_across_runs() {
    let provisioner = hello_world_provisioner();
    let engine = TemplateEngine::new();
    let templates = ProvisionerTemplates::new(&provisioner, &engine);

    let context = claim_context();
    let first = templates.eval_creation_config(&context).unwrap();
    let second = templates.eval_creation_config(&context).unwrap();

    assert_eq!(first.capacity, second.capacity);
    assert_eq!(first.handle, second.handle);
    assert_eq!(first.pod_template, second.pod_template);
}

#[test]
fn state_machines_round_trip_through_their_annotation_encoding() {
    let provisioning = ProvisioningState::AwaitCreationPod {
        creation_pod_namespace: "default".into(),
        handle: None,
        capacity: Some(1 << 30),
    };
    let json = provisioning.to_json();
    assert_eq!(ProvisioningState::from_json(&json).unwrap(), provisioning);

    let staging = StagingState::RemoveStagingPodAfterFailure {
        staging_pod_namespace: "default".into(),
        error_code: RpcCode::InvalidArgument,
        error_details: "staging pod failed: no /pav/volume".into(),
    };
    let json = staging.to_json();
    assert_eq!(StagingState::from_json(&json).unwrap(), staging);
}
