//! Wire protocol for the user directory service.
//!
//! Generated protobuf/gRPC code from `proto/userdir.proto`. The service
//! exposes a single unary lookup, `GetByID`, returning the stored user
//! record or a `NOT_FOUND` status.

/// Generated protobuf/gRPC code.
pub mod pb {
    tonic::include_proto!("userdir.v1");
}

pub use pb::user_directory_client::UserDirectoryClient;
pub use pb::user_directory_server::{UserDirectory, UserDirectoryServer};
pub use pb::{GetByIdRequest, User};
