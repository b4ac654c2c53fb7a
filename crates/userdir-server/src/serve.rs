//! Listener and serving loops
//!
//! Three shapes, selected by the resolved security mode:
//!
//! - plaintext: the gRPC server bound directly, no TLS;
//! - dedicated TLS port: one accept loop, each connection handshakes with
//!   the mode's certificate supplier and carries only gRPC;
//! - shared listener (domain-validated mode): same accept loop, but every
//!   request is classified and non-gRPC traffic gets the diagnostic
//!   fallback, with validation proofs answered on a plain HTTP listener.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tonic::body::BoxBody;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use userdir_cert::{AcmeManager, TlsCredentials};
use userdir_proto::UserDirectoryServer;
use userdir_router::{Dispatch, TlsSessionInfo};

use crate::service::UserDirectoryService;

type GrpcServer = UserDirectoryServer<UserDirectoryService>;

/// How often the background task checks whether renewal is due.
const RENEWAL_CHECK_PERIOD: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serve gRPC without transport security on a dedicated port.
pub async fn run_plaintext(
    addr: SocketAddr,
    service: UserDirectoryService,
) -> Result<(), ServeError> {
    info!("listening on {addr} (no transport security)");

    tonic::transport::Server::builder()
        .add_service(UserDirectoryServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("listener closed, in-flight calls drained");
    Ok(())
}

/// Serve gRPC behind TLS, with the shared-listener demultiplexer when the
/// credentials carry a domain-validation manager.
pub async fn run_tls(
    addr: SocketAddr,
    tls: TlsCredentials,
    service: UserDirectoryService,
) -> Result<(), ServeError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    run_tls_listener(listener, tls, service).await
}

/// Accept loop over an already-bound listener. Separated out so tests can
/// bind an ephemeral port.
pub async fn run_tls_listener(
    listener: TcpListener,
    tls: TlsCredentials,
    service: UserDirectoryService,
) -> Result<(), ServeError> {
    let local_addr = listener.local_addr()?;
    let grpc = UserDirectoryServer::new(service);
    let acceptor = TlsAcceptor::from(tls.server_config());
    let shared = tls.acme().is_some();

    if let Some(acme) = tls.acme() {
        // Domain validation proves control over plain HTTP; the proofs
        // live in the manager, this task only serves them.
        tokio::spawn(serve_validation_challenges(acme));
        info!("listening on {local_addr} (shared gRPC and HTTP listener)");
    } else {
        info!("listening on {local_addr}");
    }

    // Background renewal keeps handshakes off the issuance path most of
    // the time. The immediate first tick is consumed so initial issuance
    // stays with the first handshake that needs it.
    {
        let tls = tls.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RENEWAL_CHECK_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = tls.refresh().await {
                    warn!("background certificate refresh failed: {e}");
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, closing listener");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("new connection from {peer}");
                    let acceptor = acceptor.clone();
                    let tls = tls.clone();
                    let grpc = grpc.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, acceptor, tls, grpc, shared).await;
                    });
                }
                Err(e) => error!("listener accept error: {e}"),
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    tls: TlsCredentials,
    grpc: GrpcServer,
    shared: bool,
) {
    // Renewal happens here, before the handshake: the connection that hits
    // the renewal window blocks on reissuance, idle connections do not.
    if let Err(e) = tls.refresh().await {
        warn!("no usable server certificate for {peer}: {e}");
        return;
    }

    let tls_stream = match acceptor.accept(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!("TLS handshake failed from {peer}: {e}");
            return;
        }
    };

    let session = session_info(tls_stream.get_ref().1);
    let acme = tls.acme();

    let service = service_fn(move |request: Request<Incoming>| {
        let grpc = grpc.clone();
        let session = session.clone();
        let acme = acme.clone();
        async move {
            let response = if shared {
                route_request(request, grpc, peer, session, acme).await
            } else {
                serve_grpc(request, grpc).await
            };
            Ok::<_, Infallible>(response)
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!("connection error from {peer}: {e}");
    }
}

/// Shared-listener dispatch: gRPC to the RPC server, validation proofs and
/// the plaintext diagnostic to everything else.
async fn route_request(
    request: Request<Incoming>,
    grpc: GrpcServer,
    peer: SocketAddr,
    session: TlsSessionInfo,
    acme: Option<Arc<AcmeManager>>,
) -> Response<BoxBody> {
    match userdir_router::dispatch(&request) {
        Dispatch::Rpc => serve_grpc(request, grpc).await,
        Dispatch::Fallback => {
            if let Some(token) = userdir_router::acme_challenge_token(request.uri().path()) {
                if let Some(proof) = acme.as_ref().and_then(|a| a.challenge_response(token)) {
                    return text_response(StatusCode::OK, proof);
                }
                return text_response(StatusCode::NOT_FOUND, "unknown challenge\n".to_string());
            }

            text_response(
                StatusCode::OK,
                userdir_router::fallback_body(peer, Some(&session)),
            )
        }
    }
}

async fn serve_grpc(request: Request<Incoming>, grpc: GrpcServer) -> Response<BoxBody> {
    match grpc.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    }
}

/// Plain-HTTP responder for `/.well-known/acme-challenge/` lookups. The
/// validation protocol connects on port 80; nothing else is served there.
async fn serve_validation_challenges(acme: Arc<AcmeManager>) {
    let addr: SocketAddr = "0.0.0.0:80".parse().expect("static socket address");
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("cannot bind {addr} for validation challenges: {e}");
            return;
        }
    };
    info!("serving domain-validation challenges on {addr}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("challenge listener accept error: {e}");
                continue;
            }
        };

        let acme = acme.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let acme = acme.clone();
                async move {
                    let response = match userdir_router::acme_challenge_token(request.uri().path())
                        .and_then(|token| acme.challenge_response(token))
                    {
                        Some(proof) => text_response(StatusCode::OK, proof),
                        None => text_response(StatusCode::NOT_FOUND, "not found\n".to_string()),
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(e) = builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("challenge connection error from {peer}: {e}");
            }
        });
    }
}

fn session_info(connection: &rustls::ServerConnection) -> TlsSessionInfo {
    TlsSessionInfo {
        protocol: connection.protocol_version().map(|v| format!("{v:?}")),
        cipher_suite: connection
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite())),
        alpn: connection
            .alpn_protocol()
            .map(|alpn| String::from_utf8_lossy(alpn).into_owned()),
        server_name: connection.server_name().map(str::to_string),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("static response parts")
}

fn full_body(text: String) -> BoxBody {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining connections");
}
