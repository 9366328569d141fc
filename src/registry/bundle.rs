//! Infrastructure bundle of a provisioner
//!
//! Existence of a PavProvisioner implies existence of this bundle: a
//! namespace, the two plugin service accounts, their cluster role bindings,
//! the controller-plugin Deployment (with the embedded external-provisioner
//! sidecar), the node-plugin DaemonSet (with the embedded
//! node-driver-registrar sidecar), and the CSIDriver registration object.
//! Everything is labelled and owner-referenced back to the provisioner, and
//! applied idempotently with server-side apply.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, Namespace, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, SecurityContext, ServiceAccount, Volume, VolumeMount,
    EmptyDirVolumeSource,
};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use k8s_openapi::api::storage::v1::{CSIDriver, CSIDriverSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::config::{
    CONTROLLER_PLUGIN_CLUSTER_ROLE, DOMAIN, NODE_PLUGIN_CLUSTER_ROLE, PAV_VOLUME_DIR,
};
use crate::crd::PavProvisioner;
use crate::error::Error;

/// Image of the embedded external-provisioner sidecar.
const EXTERNAL_PROVISIONER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-provisioner:v5.1.0";

/// Image of the embedded node-driver-registrar sidecar.
const NODE_REGISTRAR_IMAGE: &str =
    "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.13.0";

/// Namespace holding the plugin workloads of a provisioner.
pub fn bundle_namespace(provisioner_name: &str) -> String {
    format!("pav-{provisioner_name}")
}

/// The bundle objects in creation order. Deletion happens in reverse.
pub struct Bundle {
    pub namespace: Namespace,
    pub service_accounts: Vec<ServiceAccount>,
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
    pub controller_deployment: Deployment,
    pub node_daemonset: DaemonSet,
    pub csi_driver: CSIDriver,
}

/// Render the bundle for a provisioner. `image` is the PaV image the plugin
/// containers run.
pub fn render_bundle(provisioner: &PavProvisioner, image: &str) -> Result<Bundle, Error> {
    let name = provisioner.name_any();
    let uid = provisioner
        .uid()
        .ok_or_else(|| Error::internal("provisioner has no uid"))?;
    let namespace = bundle_namespace(&name);

    let owner = OwnerReference {
        api_version: format!("{DOMAIN}/v1alpha1"),
        kind: "PavProvisioner".to_string(),
        name: name.clone(),
        uid: uid.clone(),
        ..Default::default()
    };

    let labels: BTreeMap<String, String> =
        [(format!("{DOMAIN}/provisioner"), name.clone())].into();

    let meta = |object_name: &str, namespaced: bool| ObjectMeta {
        name: Some(object_name.to_string()),
        namespace: namespaced.then(|| namespace.clone()),
        labels: Some(labels.clone()),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    };

    let service_accounts = vec![
        ServiceAccount {
            metadata: meta("pav-controller-plugin", true),
            ..Default::default()
        },
        ServiceAccount {
            metadata: meta("pav-node-plugin", true),
            ..Default::default()
        },
    ];

    let binding = |binding_name: String, role: &str, account: &str| ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: account.to_string(),
            namespace: Some(namespace.clone()),
            ..Default::default()
        }]),
    };

    let cluster_role_bindings = vec![
        binding(
            format!("{namespace}-controller-plugin"),
            CONTROLLER_PLUGIN_CLUSTER_ROLE,
            "pav-controller-plugin",
        ),
        binding(
            format!("{namespace}-node-plugin"),
            NODE_PLUGIN_CLUSTER_ROLE,
            "pav-node-plugin",
        ),
    ];

    Ok(Bundle {
        namespace: Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            ..Default::default()
        },
        service_accounts,
        cluster_role_bindings,
        controller_deployment: controller_deployment(
            &name, &uid, image, &namespace, &labels, &owner,
        ),
        node_daemonset: node_daemonset(&name, &uid, image, &namespace, &labels, &owner),
        csi_driver: CSIDriver {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            spec: CSIDriverSpec {
                attach_required: Some(false),
                // exposes the client pod's identity in the publish request
                pod_info_on_mount: Some(true),
                volume_lifecycle_modes: Some(vec!["Persistent".to_string()]),
                ..Default::default()
            },
        },
    })
}

fn csi_socket_mount() -> VolumeMount {
    VolumeMount {
        name: "socket-dir".to_string(),
        mount_path: "/csi".to_string(),
        ..Default::default()
    }
}

fn controller_deployment(
    name: &str,
    uid: &str,
    image: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> Deployment {
    let mut pod_labels = labels.clone();
    pod_labels.insert("app".to_string(), "controller-plugin".to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some("controller-plugin".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // a single writer per provisioner; no leader election needed
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("pav-controller-plugin".to_string()),
                    containers: vec![
                        Container {
                            name: "csi-plugin".to_string(),
                            image: Some(image.to_string()),
                            args: Some(vec![
                                "csi-controller".to_string(),
                                "--provisioner".to_string(),
                                name.to_string(),
                                "--provisioner-uid".to_string(),
                                uid.to_string(),
                            ]),
                            volume_mounts: Some(vec![csi_socket_mount()]),
                            ..Default::default()
                        },
                        Container {
                            name: "external-provisioner".to_string(),
                            image: Some(EXTERNAL_PROVISIONER_IMAGE.to_string()),
                            args: Some(vec![
                                "--csi-address=/csi/socket".to_string(),
                                "--extra-create-metadata".to_string(),
                            ]),
                            volume_mounts: Some(vec![csi_socket_mount()]),
                            ..Default::default()
                        },
                    ],
                    volumes: Some(vec![Volume {
                        name: "socket-dir".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node_daemonset(
    name: &str,
    uid: &str,
    image: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> DaemonSet {
    let mut pod_labels = labels.clone();
    pod_labels.insert("app".to_string(), "node-plugin".to_string());

    let plugin_dir = format!("/var/lib/kubelet/plugins/{name}");
    let node_name_env = EnvVar {
        name: "NODE_NAME".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let host_path = |path: &str| {
        Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        })
    };

    DaemonSet {
        metadata: ObjectMeta {
            name: Some("node-plugin".to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some("pav-node-plugin".to_string()),
                    containers: vec![
                        Container {
                            name: "csi-plugin".to_string(),
                            image: Some(image.to_string()),
                            args: Some(vec![
                                "csi-node".to_string(),
                                "--provisioner".to_string(),
                                name.to_string(),
                                "--provisioner-uid".to_string(),
                                uid.to_string(),
                                "--node-name".to_string(),
                                "$(NODE_NAME)".to_string(),
                            ]),
                            env: Some(vec![node_name_env.clone()]),
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![
                                csi_socket_mount(),
                                VolumeMount {
                                    name: "pav-volumes".to_string(),
                                    mount_path: PAV_VOLUME_DIR.to_string(),
                                    mount_propagation: Some("Bidirectional".to_string()),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        },
                        Container {
                            name: "node-driver-registrar".to_string(),
                            image: Some(NODE_REGISTRAR_IMAGE.to_string()),
                            args: Some(vec![
                                "--csi-address=/csi/socket".to_string(),
                                format!("--kubelet-registration-path={plugin_dir}/socket"),
                            ]),
                            volume_mounts: Some(vec![
                                csi_socket_mount(),
                                VolumeMount {
                                    name: "registration-dir".to_string(),
                                    mount_path: "/registration".to_string(),
                                    ..Default::default()
                                },
                            ]),
                            ..Default::default()
                        },
                    ],
                    volumes: Some(vec![
                        Volume {
                            name: "socket-dir".to_string(),
                            host_path: host_path(&plugin_dir),
                            ..Default::default()
                        },
                        Volume {
                            name: "registration-dir".to_string(),
                            host_path: host_path("/var/lib/kubelet/plugins_registry"),
                            ..Default::default()
                        },
                        Volume {
                            name: "pav-volumes".to_string(),
                            host_path: host_path(PAV_VOLUME_DIR),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_provisioner() -> PavProvisioner {
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
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[test]
    fn bundle_objects_carry_owner_references_to_the_provisioner() {
        let bundle = render_bundle(&sample_provisioner(), "example.org/pav:latest").unwrap();

        for owner_refs in [
            bundle.namespace.metadata.owner_references.as_ref(),
            bundle.controller_deployment.metadata.owner_references.as_ref(),
            bundle.node_daemonset.metadata.owner_references.as_ref(),
            bundle.csi_driver.metadata.owner_references.as_ref(),
        ] {
            let refs = owner_refs.expect("owner references should be set");
            assert_eq!(refs[0].kind, "PavProvisioner");
            assert_eq!(refs[0].name, "hello");
            assert_eq!(refs[0].uid, "uid-hello");
        }
    }

    #[test]
    fn controller_deployment_is_a_single_replica_with_recreate_rollout() {
        let bundle = render_bundle(&sample_provisioner(), "img").unwrap();
        let spec = bundle.controller_deployment.spec.unwrap();

        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));

        let containers = spec.template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "csi-plugin");
        assert_eq!(containers[1].name, "external-provisioner");
        assert!(containers[0]
            .args
            .as_ref()
            .unwrap()
            .contains(&"csi-controller".to_string()));
    }

    #[test]
    fn node_daemonset_mounts_the_pav_root_bidirectionally() {
        let bundle = render_bundle(&sample_provisioner(), "img").unwrap();
        let pod_spec = bundle.node_daemonset.spec.unwrap().template.spec.unwrap();

        let plugin = &pod_spec.containers[0];
        assert_eq!(plugin.security_context.as_ref().unwrap().privileged, Some(true));

        let pav_mount = plugin
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "pav-volumes")
            .expect("pav volume mount");
        assert_eq!(pav_mount.mount_path, "/var/lib/kubernetes-pav");
        assert_eq!(pav_mount.mount_propagation.as_deref(), Some("Bidirectional"));

        assert_eq!(pod_spec.containers[1].name, "node-driver-registrar");
    }

    #[test]
    fn csi_driver_requests_pod_info_on_mount() {
        let bundle = render_bundle(&sample_provisioner(), "img").unwrap();
        assert_eq!(bundle.csi_driver.metadata.name.as_deref(), Some("hello"));
        assert_eq!(bundle.csi_driver.spec.pod_info_on_mount, Some(true));
        assert_eq!(bundle.csi_driver.spec.attach_required, Some(false));
    }

    #[test]
    fn cluster_role_bindings_reference_the_fixed_roles() {
        let bundle = render_bundle(&sample_provisioner(), "img").unwrap();

        let roles: Vec<_> = bundle
            .cluster_role_bindings
            .iter()
            .map(|b| b.role_ref.name.as_str())
            .collect();
        assert_eq!(roles, vec!["pav-controller-plugin", "pav-node-plugin"]);

        for b in &bundle.cluster_role_bindings {
            let subject = &b.subjects.as_ref().unwrap()[0];
            assert_eq!(subject.namespace.as_deref(), Some("pav-hello"));
        }
    }
}
