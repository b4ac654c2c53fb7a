//! User directory gRPC server
//!
//! Library surface for the server binary and its integration tests:
//! the record store, the gRPC service implementation, and the serving
//! loops for each transport-security deployment mode.

pub mod serve;
pub mod service;
pub mod store;

pub use serve::{run_plaintext, run_tls, run_tls_listener, ServeError};
pub use service::UserDirectoryService;
pub use store::RecordStore;
