//! Custom Resource Definitions for PaV

mod provisioner;
mod types;

pub use provisioner::{
    PavProvisioner, PavProvisionerSpec, PavProvisionerStatus, ProvisionerPhase,
    VolumeCreationSpec, VolumeDeletionSpec, VolumeStagingSpec, VolumeUnstagingSpec,
    VolumeValidationSpec,
};
pub use types::{AccessMode, ProvisioningMode, VolumeMode};
