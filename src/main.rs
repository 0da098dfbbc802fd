//! Manga upload server binary.
//!
//! Clients register a manga or chapter with a JSON request, receive a
//! single-use upload URL, and POST the cover image or chapter archive to it.
//! Chapter archives are extracted, normalized to JPEG and passed page by page
//! to an external converter before the chapter folder is published.

mod archive;
mod atomic;
mod background;
mod config;
mod converter;
mod error;
mod http;
mod logging;
mod pages;
mod pending;
mod pipeline;
mod registry;
mod storage;
#[cfg(test)]
mod test_support;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::post;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::io::{Error as IoError, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::pipeline::PipelineConfig;
use crate::registry::UploadRegistry;
use crate::storage::Library;
use crate::upload::UploadConfig;

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), IoError> {
    let _ = dotenvy::dotenv();
    logging::init_logging();

    let args = Args::parse();
    args.validate()
        .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;

    let library = Arc::new(Library::new(args.root.clone()));
    library.ensure_root().await?;
    let registry = Arc::new(UploadRegistry::new(
        args.registry_capacity,
        args.registry_ttl(),
    ));
    let pipeline = Arc::new(PipelineConfig::from_args(&args));
    let upload_config = Arc::new(UploadConfig {
        public_port: args.public_port,
    });
    info!(
        root = ?library.root_path(),
        backup = ?pipeline.backup_root,
        converter = ?args.converter,
        suffixes = ?pipeline.supported_suffixes,
        "configuration loaded"
    );

    let body_limit = if args.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(args.upload_max_size).unwrap_or(usize::MAX))
    };
    let router = app(
        library,
        registry.clone(),
        pipeline,
        upload_config,
        body_limit,
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| IoError::new(ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(registry);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

/// 组装路由与中间件。
fn app(
    library: Arc<Library>,
    registry: Arc<UploadRegistry>,
    pipeline: Arc<PipelineConfig>,
    upload_config: Arc<UploadConfig>,
    body_limit: DefaultBodyLimit,
    cors_origins: Option<&str>,
) -> Router {
    let app = Router::new()
        .route("/create/manga", post(upload::create_manga))
        .route("/create/chapter", post(upload::create_chapter))
        .route(
            "/upload/{token}",
            post(upload::upload_payload).layer(body_limit),
        )
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
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(library))
        .layer(Extension(registry))
        .layer(Extension(pipeline))
        .layer(Extension(upload_config));

    match build_cors_layer(cors_origins) {
        Some(cors_layer) => app.layer(cors_layer),
        None => app,
    }
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

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
