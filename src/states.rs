//! Volume lifecycle state machines
//!
//! Both machines are persisted as JSON in object annotations: the
//! provisioning machine on the claim, the staging machine on the client pod
//! (one instance per claim the pod mounts). The CSI plugins seed initial
//! states and watch for terminal ones; the node agents drive every
//! transition in between.

use serde::{Deserialize, Serialize};

/// RPC status code carried by failure states, using the standard
/// container-storage taxonomy.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RpcCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    Aborted,
    DeadlineExceeded,
    Internal,
}

impl From<RpcCode> for tonic::Code {
    fn from(code: RpcCode) -> Self {
        match code {
            RpcCode::NotFound => tonic::Code::NotFound,
            RpcCode::AlreadyExists => tonic::Code::AlreadyExists,
            RpcCode::InvalidArgument => tonic::Code::InvalidArgument,
            RpcCode::FailedPrecondition => tonic::Code::FailedPrecondition,
            RpcCode::Aborted => tonic::Code::Aborted,
            RpcCode::DeadlineExceeded => tonic::Code::DeadlineExceeded,
            RpcCode::Internal => tonic::Code::Internal,
        }
    }
}

/// States of the volume validation, creation, and deletion machine.
///
/// ```text
/// LaunchValidationPod ──> AwaitValidationPod ──> RemoveValidationPod ──┐
///        │                        │                                    │
///        │                        └──> RemoveValidationPodAfterFailure │
///        ▼                                         │                   ▼
/// LaunchCreationPod <───────────────────────────────────────────────────
///        │
///        ▼
/// AwaitCreationPod ──> RemoveCreationPod ──> Created ──> LaunchDeletionPod
///        │                                                      │
///        └──> RemoveCreationPodAfterFailure                     ▼
///                     │                                 AwaitDeletionPod
///                     ▼                                         │
///        LaunchDeletionPodAfterFailure                          ▼
///                     │                                RemoveDeletionPod
///                     ▼                                         │
///        AwaitDeletionPodAfterFailure                           ▼
///                     │                                      Deleted
///                     ▼
///        RemoveDeletionPodAfterFailure ──> CreationFailed
/// ```
///
/// A failed deletion pod parks the machine in `UnrecoverableFailure`.
/// States that read `/pav` files carry the worker pod's namespace; the
/// claim label pins them to the node holding the `/pav` host directory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "name")]
pub enum ProvisioningState {
    LaunchValidationPod,
    AwaitValidationPod {
        validation_pod_namespace: String,
    },
    RemoveValidationPod {
        validation_pod_namespace: String,
    },
    RemoveValidationPodAfterFailure {
        validation_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    LaunchCreationPod,
    AwaitCreationPod {
        creation_pod_namespace: String,
        handle: Option<String>,
        capacity: Option<i64>,
    },
    RemoveCreationPod {
        creation_pod_namespace: String,
        handle: String,
        capacity: i64,
    },
    RemoveCreationPodAfterFailure {
        creation_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    Created {
        handle: String,
        capacity: i64,
    },
    LaunchDeletionPod,
    AwaitDeletionPod {
        deletion_pod_namespace: String,
    },
    RemoveDeletionPod {
        deletion_pod_namespace: String,
    },
    Deleted,
    LaunchDeletionPodAfterFailure {
        error_code: RpcCode,
        error_details: String,
    },
    AwaitDeletionPodAfterFailure {
        deletion_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    RemoveDeletionPodAfterFailure {
        deletion_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    CreationFailed {
        error_code: RpcCode,
        error_details: String,
    },
    UnrecoverableFailure {
        error_code: RpcCode,
        error_details: String,
    },
}

impl ProvisioningState {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("state serialization is infallible")
    }

    /// Whether the state belongs to the deletion side of the machine (the
    /// volume, if it ever existed, is being or has been torn down).
    pub fn is_after_created(&self) -> bool {
        matches!(
            self,
            Self::LaunchDeletionPod
                | Self::AwaitDeletionPod { .. }
                | Self::RemoveDeletionPod { .. }
                | Self::Deleted
        )
    }

    /// Terminal failure of the creation flow, surfaced through the RPC.
    pub fn failure(&self) -> Option<(RpcCode, &str)> {
        match self {
            Self::CreationFailed {
                error_code,
                error_details,
            }
            | Self::UnrecoverableFailure {
                error_code,
                error_details,
            } => Some((*error_code, error_details)),
            _ => None,
        }
    }
}

/// States of the volume staging and unstaging machine.
///
/// ```text
/// LaunchStagingPod ──> AwaitStagingPod ──> Staged ──> RemoveStagingPod
///        │                     │                             │
///        │                     └──> RemoveStagingPodAfterFailure
///        ▼                                  │                ▼
/// StagingFailed <── (unstaging arm) <── LaunchUnstagingPod[AfterFailure]
///                                            │
///                       AwaitUnstagingPod[AfterFailure]
///                                            │
///                       RemoveUnstagingPod[AfterFailure]
///                                            │
///                                 Unstaged / StagingFailed
/// ```
///
/// A failed unstaging pod parks the machine in `UnrecoverableFailure`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "name")]
pub enum StagingState {
    LaunchStagingPod,
    AwaitStagingPod {
        staging_pod_namespace: String,
    },
    Staged {
        staging_pod_namespace: String,
    },
    RemoveStagingPod {
        staging_pod_namespace: String,
    },
    RemoveStagingPodAfterFailure {
        staging_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    LaunchUnstagingPod,
    AwaitUnstagingPod {
        unstaging_pod_namespace: String,
    },
    RemoveUnstagingPod {
        unstaging_pod_namespace: String,
    },
    Unstaged,
    LaunchUnstagingPodAfterFailure {
        error_code: RpcCode,
        error_details: String,
    },
    AwaitUnstagingPodAfterFailure {
        unstaging_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    RemoveUnstagingPodAfterFailure {
        unstaging_pod_namespace: String,
        error_code: RpcCode,
        error_details: String,
    },
    StagingFailed {
        error_code: RpcCode,
        error_details: String,
    },
    UnrecoverableFailure {
        error_code: RpcCode,
        error_details: String,
    },
}

impl StagingState {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("state serialization is infallible")
    }

    /// Whether the state belongs to the unstaging side of the machine.
    pub fn is_after_staged(&self) -> bool {
        matches!(
            self,
            Self::RemoveStagingPod { .. }
                | Self::LaunchUnstagingPod
                | Self::AwaitUnstagingPod { .. }
                | Self::RemoveUnstagingPod { .. }
                | Self::Unstaged
        )
    }

    /// Terminal failure of the staging flow, surfaced through the RPC.
    pub fn failure(&self) -> Option<(RpcCode, &str)> {
        match self {
            Self::StagingFailed {
                error_code,
                error_details,
            }
            | Self::UnrecoverableFailure {
                error_code,
                error_details,
            } => Some((*error_code, error_details)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_states_round_trip_through_json() {
        let states = [
            ProvisioningState::LaunchValidationPod,
            ProvisioningState::AwaitCreationPod {
                creation_pod_namespace: "pav-test".into(),
                handle: Some("vol-1".into()),
                capacity: None,
            },
            ProvisioningState::Created {
                handle: "vol-1".into(),
                capacity: 1 << 30,
            },
            ProvisioningState::CreationFailed {
                error_code: RpcCode::InvalidArgument,
                error_details: "validation pod failed".into(),
            },
        ];

        for state in states {
            let json = state.to_json();
            assert_eq!(ProvisioningState::from_json(&json).unwrap(), state);
        }
    }

    #[test]
    fn staging_states_round_trip_through_json() {
        let states = [
            StagingState::LaunchStagingPod,
            StagingState::Staged {
                staging_pod_namespace: "pav-test".into(),
            },
            StagingState::Unstaged,
            StagingState::UnrecoverableFailure {
                error_code: RpcCode::Internal,
                error_details: "unstaging pod failed".into(),
            },
        ];

        for state in states {
            let json = state.to_json();
            assert_eq!(StagingState::from_json(&json).unwrap(), state);
        }
    }

    #[test]
    fn the_tag_is_the_state_name() {
        let json = ProvisioningState::Deleted.to_json();
        assert_eq!(json, r#"{"name":"Deleted"}"#);
    }

    #[test]
    fn unknown_state_names_fail_to_parse() {
        assert!(ProvisioningState::from_json(r#"{"name":"Nonsense"}"#).is_err());
        assert!(StagingState::from_json(r#"{"name":"Nonsense"}"#).is_err());
    }

    #[test]
    fn after_created_covers_exactly_the_deletion_arm() {
        assert!(ProvisioningState::LaunchDeletionPod.is_after_created());
        assert!(ProvisioningState::Deleted.is_after_created());
        assert!(!ProvisioningState::LaunchValidationPod.is_after_created());
        assert!(!ProvisioningState::CreationFailed {
            error_code: RpcCode::Internal,
            error_details: String::new(),
        }
        .is_after_created());
    }

    #[test]
    fn after_staged_covers_exactly_the_unstaging_arm() {
        assert!(StagingState::LaunchUnstagingPod.is_after_staged());
        assert!(StagingState::Unstaged.is_after_staged());
        assert!(!StagingState::LaunchStagingPod.is_after_staged());
        assert!(!StagingState::Staged {
            staging_pod_namespace: "ns".into()
        }
        .is_after_staged());
    }

    #[test]
    fn failure_extracts_code_and_details() {
        let state = StagingState::StagingFailed {
            error_code: RpcCode::InvalidArgument,
            error_details: "no /pav/volume".into(),
        };
        let (code, details) = state.failure().unwrap();
        assert_eq!(tonic::Code::from(code), tonic::Code::InvalidArgument);
        assert_eq!(details, "no /pav/volume");
    }
}
