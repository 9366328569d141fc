//! Generated container-storage-interface code
//!
//! The message and service definitions live in `proto/csi.proto`, a reduced
//! copy of the upstream CSI specification covering the surface PaV serves.

#![allow(missing_docs)]

/// Version 1 of the container storage interface.
pub mod v1 {
    tonic::include_proto!("csi.v1");
}

pub use v1::*;
