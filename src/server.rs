use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinError;

use crate::api::{self, context, AppState};
use crate::config::ServerConfig;
use crate::error::MapMarkError;

/// How long in-flight requests get to finish after a shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on files per upload request; only sizes the body limit.
const MAX_FILES_PER_UPLOAD: usize = 20;

const UPLOAD_CACHE_CONTROL: &str = "public, max-age=3600";

pub struct WebServer {
    config: ServerConfig,
    state: AppState,
}

impl WebServer {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn start(self) -> Result<(), MapMarkError> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| MapMarkError::Error(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MapMarkError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("mapmark server listening on http://{}", addr);
        info!("Server listening on {}", addr);

        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on `listener` until `shutdown` completes, then drains in-flight
    /// requests for at most `SHUTDOWN_GRACE` before aborting them.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), MapMarkError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state, &self.config);
        let (drain_tx, drain_rx) = oneshot::channel::<()>();

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.await;
        });
        let mut handle = tokio::spawn(async move { server.await });

        tokio::select! {
            result = &mut handle => return server_result(result),
            _ = shutdown => {
                info!("Shutdown signal received, draining connections");
                println!("\nShutting down...");
                let _ = drain_tx.send(());
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(result) => {
                info!("Server shutdown complete");
                server_result(result)
            }
            Err(_) => {
                warn!(
                    "Requests still running after {:?}, forcing shutdown",
                    SHUTDOWN_GRACE
                );
                handle.abort();
                Ok(())
            }
        }
    }
}

fn server_result(result: Result<io::Result<()>, JoinError>) -> Result<(), MapMarkError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(MapMarkError::Error(format!("Server error: {}", e))),
        Err(e) => Err(MapMarkError::Error(format!("Server task failed: {}", e))),
    }
}

/// The complete application: API routes, static files and the middleware
/// that wraps every request.
///
/// Only routes that never write run under the handler timeout; mutating
/// handlers always run to completion.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    let upload_limit =
        (config.max_file_size as usize).saturating_mul(MAX_FILES_PER_UPLOAD) + (1 << 20);
    let timeout = middleware::from_fn_with_state(
        Duration::from_secs(config.write_timeout),
        context::enforce_timeout,
    );

    Router::new()
        // Health check
        .route("/health", get(health_check).layer(timeout.clone()))

        // Marker endpoints
        .route("/api/markers", post(api::markers::create_marker))
        .route(
            "/api/markers",
            get(api::markers::list_markers).layer(timeout.clone()),
        )
        .route("/api/markers/{id}", put(api::markers::update_marker))
        .route("/api/markers/{id}", delete(api::markers::delete_marker))

        // Image endpoints
        .route(
            "/api/markers/{id}/images",
            post(api::images::upload_images).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/markers/{id}/images/{filename}",
            delete(api::images::delete_image),
        )

        // Analytics and map proxy
        .route(
            "/api/visits",
            get(api::visits::get_visits).layer(timeout.clone()),
        )
        .route(
            "/api/amap-staticmap",
            get(api::map::static_map).layer(timeout.clone()),
        )

        // Static content
        .route("/uploads/{file}", get(upload_file).layer(timeout.clone()))
        .route("/static/{*path}", get(static_file).layer(timeout.clone()))
        .route(
            "/admin",
            get(|state: State<AppState>| page(state, "index.html")).layer(timeout.clone()),
        )
        .route(
            "/view",
            get(|state: State<AppState>| page(state, "view.html")).layer(timeout.clone()),
        )
        .route(
            "/login",
            get(|state: State<AppState>| page(state, "login.html")).layer(timeout.clone()),
        )
        .route(
            "/pdf-report",
            get(|state: State<AppState>| page(state, "pdf-report.html")).layer(timeout),
        )
        .route("/", get(root_redirect))

        .layer(middleware::from_fn_with_state(
            state.clone(),
            context::track_visit,
        ))
        .with_state(state)
}

async fn health_check() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::OK,
        Html("<h1>mapmark</h1><p>Server is running</p>"),
    )
}

async fn root_redirect() -> impl IntoResponse {
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, "/admin")])
}

async fn page(State(state): State<AppState>, file: &'static str) -> Response {
    serve_file(state.static_dir.join(file), None).await
}

async fn static_file(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match safe_join(&state.static_dir, &path) {
        Some(file) => serve_file(file, None).await,
        None => not_found(),
    }
}

async fn upload_file(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    match safe_join(state.uploads.dir(), &file) {
        Some(path) => serve_file(path, Some(UPLOAD_CACHE_CONTROL)).await,
        None => not_found(),
    }
}

/// Joins `relative` onto `base`, refusing anything that could leave `base`:
/// parent components, absolute paths and drive prefixes.
fn safe_join(base: &FsPath, relative: &str) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    let mut pushed = false;
    for component in FsPath::new(relative).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    pushed.then_some(path)
}

async fn serve_file(path: PathBuf, cache_control: Option<&'static str>) -> Response {
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(_) => return not_found(),
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut response = (
        [(header::CONTENT_TYPE, mime.as_ref().to_string())],
        Body::from(content),
    )
        .into_response();

    if let Some(value) = cache_control {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static(value),
        );
    }
    response
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "404 Not Found").into_response()
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
