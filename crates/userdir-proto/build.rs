//! Build script for userdir-proto
//!
//! Compiles the user directory Protocol Buffer definitions for gRPC support.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/userdir.proto"], &["proto/"])?;

    // Rerun if proto files change
    println!("cargo:rerun-if-changed=proto/userdir.proto");

    Ok(())
}
