//! End-to-end serving over TLS: the dedicated gRPC port and the shared
//! listener that demultiplexes gRPC from plain HTTP.

use std::sync::Arc;

use userdir_cert::{
    generate_self_signed_cert, obtain, ClientSecurityOptions, CredentialSpec, ObtainOptions,
    ServerSecurityOptions, TransportCredentials,
};
use userdir_proto::{GetByIdRequest, UserDirectoryClient};
use userdir_server::{run_tls_listener, RecordStore, UserDirectoryService};

async fn spawn_tls_server(credentials: TransportCredentials) -> u16 {
    let TransportCredentials::Tls(tls) = credentials else {
        panic!("expected TLS credentials");
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let service = UserDirectoryService::new(Arc::new(RecordStore::with_seed_data()));
    tokio::spawn(async move {
        run_tls_listener(listener, tls, service).await.unwrap();
    });

    port
}

/// Client channel over TLS that skips certificate verification, since the
/// server presents a self-signed throwaway certificate.
async fn skip_verify_channel(port: u16) -> tonic::transport::Channel {
    let spec = CredentialSpec::resolve_client(&ClientSecurityOptions {
        skip_verify: true,
        ..Default::default()
    })
    .unwrap();
    let config = userdir_cert::client_config(&spec).unwrap().unwrap();
    let connector = tokio_rustls::TlsConnector::from(config);

    tonic::transport::Endpoint::from_shared(format!("https://localhost:{port}"))
        .unwrap()
        .connect_with_connector(tower::service_fn(move |_: tonic::transport::Uri| {
            let connector = connector.clone();
            async move {
                let tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
                let name = rustls::pki_types::ServerName::try_from("localhost")
                    .expect("static server name");
                let tls = connector.connect(name, tcp).await?;
                Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(tls))
            }
        }))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lookup_over_dedicated_tls_port() {
    userdir_cert::install_crypto_provider();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("service.pem");
    let key_path = dir.path().join("service.key");
    generate_self_signed_cert()
        .unwrap()
        .save_to_files(&cert_path, &key_path)
        .unwrap();

    let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
        static_cert: true,
        cert_path: Some(cert_path),
        key_path: Some(key_path),
        ..Default::default()
    })
    .unwrap();
    let credentials = obtain(&spec, &ObtainOptions::default()).unwrap();

    let port = spawn_tls_server(credentials).await;
    let mut client = UserDirectoryClient::new(skip_verify_channel(port).await);

    let user = client
        .get_by_id(GetByIdRequest { id: 1 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(user.name, "Nicolas");

    let status = client.get_by_id(GetByIdRequest { id: 7 }).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn test_shared_listener_demultiplexes() {
    userdir_cert::install_crypto_provider();

    // Seed the validation cache so the shared listener has a certificate
    // without talking to a real issuer.
    let cache = tempfile::tempdir().unwrap();
    let cert = generate_self_signed_cert().unwrap();
    std::fs::write(cache.path().join("example.com.crt"), &cert.pem_cert).unwrap();
    std::fs::write(cache.path().join("example.com.key"), &cert.pem_key).unwrap();

    let spec = CredentialSpec::resolve_server(&ServerSecurityOptions {
        acme: true,
        domain: Some("example.com".to_string()),
        ..Default::default()
    })
    .unwrap();
    let credentials = obtain(
        &spec,
        &ObtainOptions {
            acme_cache_dir: Some(cache.path().to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();

    let port = spawn_tls_server(credentials).await;

    // gRPC goes to the RPC server.
    let mut client = UserDirectoryClient::new(skip_verify_channel(port).await);
    let user = client
        .get_by_id(GetByIdRequest { id: 1 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(user.name, "Nicolas");

    // Anything else gets the plaintext diagnostic from the fallback.
    let http = reqwest::Client::builder()
        .use_rustls_tls()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap();
    let response = http
        .get(format!("https://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body = response.text().await.unwrap();
    assert!(body.contains("user directory service"));
    assert!(body.contains("caller:"));
}
