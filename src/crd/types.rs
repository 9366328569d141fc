//! Scalar types shared across the PavProvisioner spec and the volume
//! lifecycle.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How volumes may be provisioned under a provisioner.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ProvisioningMode {
    /// Volumes are created on demand from claims.
    Dynamic,
    /// Volumes are pre-provisioned by the operator.
    Static,
}

/// Volume mode of a claim or persistent volume.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("Filesystem"),
            Self::Block => f.write_str("Block"),
        }
    }
}

impl FromStr for VolumeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "Filesystem" => Ok(Self::Filesystem),
            "Block" => Ok(Self::Block),
            other => Err(Error::schema(format!("invalid volume mode {other:?}"))),
        }
    }
}

/// Access mode of a claim or persistent volume.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl AccessMode {
    pub const ALL: [AccessMode; 3] = [
        AccessMode::ReadWriteOnce,
        AccessMode::ReadOnlyMany,
        AccessMode::ReadWriteMany,
    ];
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadWriteOnce => f.write_str("ReadWriteOnce"),
            Self::ReadOnlyMany => f.write_str("ReadOnlyMany"),
            Self::ReadWriteMany => f.write_str("ReadWriteMany"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "ReadWriteOnce" => Ok(Self::ReadWriteOnce),
            "ReadOnlyMany" => Ok(Self::ReadOnlyMany),
            "ReadWriteMany" => Ok(Self::ReadWriteMany),
            other => Err(Error::schema(format!("invalid access mode {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_modes_round_trip_through_their_wire_strings() {
        for mode in [VolumeMode::Filesystem, VolumeMode::Block] {
            assert_eq!(mode.to_string().parse::<VolumeMode>().unwrap(), mode);
        }
        assert!("filesystem".parse::<VolumeMode>().is_err());
    }

    #[test]
    fn access_modes_round_trip_through_their_wire_strings() {
        for mode in AccessMode::ALL {
            assert_eq!(mode.to_string().parse::<AccessMode>().unwrap(), mode);
        }
        assert!("ReadWriteOncePod".parse::<AccessMode>().is_err());
    }
}
