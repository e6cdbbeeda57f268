//! AxoDrive resumable upload server.
//!
//! Clients split large files into fixed-size chunks, send them in any order
//! and resume after interruptions. This binary wires the upload session
//! manager, its session store backend and the abandoned-upload janitor into
//! an Axum router behind the authenticating proxy.

mod assembler;
mod atomic;
mod auth;
mod chunk_store;
mod config;
mod error;
mod file_store;
mod http;
mod janitor;
mod kv;
mod locking;
mod logging;
mod manager;
mod notify;
mod session;
mod session_store;
mod storage;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{HeaderName, Request};
use axum::routing::{get, patch, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::AuthConfig;
use crate::config::{Args, StoreBackend, UploadConfig};
use crate::file_store::FileStore;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::kv::{KeyValueStore, MemoryStore};
use crate::manager::UploadSessionManager;
use crate::notify::LogNotifier;
use crate::storage::Storage;

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_filter);

    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    let kv: Arc<dyn KeyValueStore> = match args.session_store {
        StoreBackend::File => Arc::new(
            FileStore::open(PathBuf::from(&args.state_dir))
                .await
                .map_err(std::io::Error::other)?,
        ),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    let user_header = HeaderName::from_bytes(args.user_header.trim().as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let auth_config = Arc::new(AuthConfig { user_header });
    let upload_config = Arc::new(UploadConfig::from_args(&args));
    let manager = Arc::new(UploadSessionManager::new(
        upload_config,
        storage.clone(),
        kv,
        Arc::new(LogNotifier),
    ));
    let janitor = Arc::new(manager.janitor());

    let mut app = Router::new()
        .route("/api/health", get(http::health))
        .route("/api/upload/init", post(upload::init_upload))
        .route(
            "/api/upload/chunk",
            patch(upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/status", get(upload::upload_status))
        .route("/api/upload/pause", post(upload::pause_upload))
        .route("/api/upload/resume", post(upload::resume_upload))
        .route("/api/upload/cancel", post(upload::cancel_upload))
        .route("/api/upload/complete", post(upload::complete_upload))
        .route("/api/upload/active", get(upload::active_uploads))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(manager))
        .layer(Extension(auth_config));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(
        addr = %http_addr,
        storage_dir = ?storage.root_path(),
        session_store = ?args.session_store,
        "starting upload server"
    );

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    let janitor_task = janitor.spawn();
    tokio::spawn(shutdown_signal(handle));
    let served = http_server.await;
    janitor_task.abort();
    served?;

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
