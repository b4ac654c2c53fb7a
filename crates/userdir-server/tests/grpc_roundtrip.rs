//! End-to-end lookup over a plaintext listener.

use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;

use userdir_proto::{GetByIdRequest, UserDirectoryClient, UserDirectoryServer};
use userdir_server::{RecordStore, UserDirectoryService};

#[tokio::test]
async fn test_lookup_over_plaintext_grpc() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = UserDirectoryService::new(Arc::new(RecordStore::with_seed_data()));
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(UserDirectoryServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = UserDirectoryClient::new(channel);

    let user = client
        .get_by_id(GetByIdRequest { id: 1 })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(user.name, "Nicolas");
    assert_eq!(user.id, 1);

    let status = client.get_by_id(GetByIdRequest { id: 2 }).await.unwrap_err();
    assert_eq!(status.code(), tonic::Code::NotFound);
}
