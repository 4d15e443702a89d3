//! emberkv gRPC Protocol Definitions
//!
//! This crate contains the generated gRPC code for the emberkv service.

/// Generated protobuf/gRPC code
pub mod emberkv {
    tonic::include_proto!("emberkv");
}

pub use emberkv::*;
