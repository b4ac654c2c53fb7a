//! gRPC lookup service
//!
//! Thin translation shim over the [`RecordStore`]: absent IDs become a
//! `NOT_FOUND` status, present ones echo the ID with the stored name.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use userdir_proto::{GetByIdRequest, User, UserDirectory};

use crate::store::RecordStore;

/// gRPC implementation of the `UserDirectory` service.
#[derive(Clone)]
pub struct UserDirectoryService {
    store: Arc<RecordStore>,
}

impl UserDirectoryService {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl UserDirectory for UserDirectoryService {
    async fn get_by_id(
        &self,
        request: Request<GetByIdRequest>,
    ) -> Result<Response<User>, Status> {
        let id = request.into_inner().id;

        match self.store.get(id) {
            Some(name) => Ok(Response::new(User {
                name: name.to_string(),
                id,
            })),
            None => Err(Status::not_found(format!("user {id} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> UserDirectoryService {
        UserDirectoryService::new(Arc::new(RecordStore::with_seed_data()))
    }

    #[tokio::test]
    async fn test_lookup_present_id() {
        let response = service()
            .get_by_id(Request::new(GetByIdRequest { id: 1 }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.name, "Nicolas");
        assert_eq!(response.id, 1);
    }

    #[tokio::test]
    async fn test_lookup_absent_id() {
        let status = service()
            .get_by_id(Request::new(GetByIdRequest { id: 2 }))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::NotFound);
    }
}
