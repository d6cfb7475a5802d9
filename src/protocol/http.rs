//! The axum surface in front of the transfer engine: Smart-HTTP endpoints
//! with their exact Content-Type contracts, token authentication (Basic and
//! Bearer, constant-time), the LFS batch API, and health.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::Engine;
use bytes::BytesMut;
use serde::Deserialize;

use crate::{
    config::{ServerConfig, StoreConfig},
    protocol::{
        lfs,
        pkt,
        smart::SmartProtocol,
        types::{AllowAll, ProtocolError, RateLimiter, ServiceType, SideBand},
    },
    storage::{ObjectStore, bucket::BucketStore, lfs as lfs_keys, schema},
};

/// Lazily opened per-repository stores over one shared bucket.
pub struct RepoManager {
    bucket: Arc<dyn BucketStore>,
    /// Directory for per-repo SQLite files; `None` keeps state in memory
    /// (tests, throwaway servers).
    data_dir: Option<PathBuf>,
    template: StoreConfig,
    repos: tokio::sync::Mutex<HashMap<String, Arc<ObjectStore>>>,
}

impl RepoManager {
    pub fn new(
        bucket: Arc<dyn BucketStore>,
        data_dir: Option<PathBuf>,
        template: StoreConfig,
    ) -> Self {
        Self {
            bucket,
            data_dir,
            template,
            repos: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn valid_repo_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 128
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
            && name != "."
            && name != ".."
    }

    pub async fn open(&self, name: &str) -> Result<Arc<ObjectStore>, ProtocolError> {
        if !Self::valid_repo_name(name) {
            return Err(ProtocolError::RepositoryNotFound(name.to_string()));
        }
        let mut repos = self.repos.lock().await;
        if let Some(store) = repos.get(name) {
            return Ok(store.clone());
        }
        let mut cfg = self.template.clone();
        cfg.repo_prefix = name.to_string();
        let db = match &self.data_dir {
            None => schema::connect("sqlite::memory:").await?,
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(ProtocolError::Io)?;
                let path = dir.join(format!("{name}.sqlite"));
                schema::connect(&format!("sqlite://{}?mode=rwc", path.display())).await?
            }
        };
        let store = ObjectStore::open(cfg, self.bucket.clone(), db).await?;
        repos.insert(name.to_string(), store.clone());
        Ok(store)
    }
}

pub struct AppState {
    pub repos: RepoManager,
    pub config: ServerConfig,
    pub limiter: Arc<dyn RateLimiter>,
}

pub type SharedState = Arc<AppState>;

/// Build the router with auth middleware applied to everything except `/`
/// and `/health`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/{repo}/info/refs", get(info_refs))
        .route("/{repo}/git-upload-pack", post(upload_pack))
        .route("/{repo}/git-receive-pack", post(receive_pack))
        .route("/{repo}/info/lfs/objects/batch", post(lfs_batch))
        .route(
            "/{repo}/info/lfs/objects/{oid}",
            get(lfs_download).put(lfs_upload),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth_layer))
        .route("/", get(index))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until the listener closes.
pub async fn serve(state: SharedState) -> Result<(), std::io::Error> {
    let addr = state.config.addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "git-tablet listening");
    axum::serve(listener, router(state)).await
}

async fn index() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "git-tablet",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> &'static str {
    "ok"
}

/// Basic (password is the secret) and Bearer tokens, both compared in
/// constant time against the configured set. Open mode when no tokens are
/// configured.
async fn auth_layer(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let principal = match authenticate(&state.config, request.headers()) {
        Ok(principal) => principal,
        Err(response) => return response,
    };
    let repo = request
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or("")
        .to_string();
    if let Err(e) = state.limiter.check(&principal, &repo).await {
        return AppError(e).into_response();
    }
    next.run(request).await
}

fn authenticate(config: &ServerConfig, headers: &HeaderMap) -> Result<String, Response> {
    if config.auth.open() {
        return Ok("anonymous".to_string());
    }
    let challenge = || {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                format!("Basic realm=\"{}\"", config.auth.realm),
            )],
            "authentication required",
        )
            .into_response()
    };

    let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
        return Err(challenge());
    };

    let (principal, secret) = if let Some(encoded) = value.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| challenge())?;
        let text = String::from_utf8(decoded).map_err(|_| challenge())?;
        match text.split_once(':') {
            // The username is informational; the password carries the token.
            Some((user, pass)) => (user.to_string(), pass.to_string()),
            None => return Err(challenge()),
        }
    } else if let Some(token) = value.strip_prefix("Bearer ") {
        ("token".to_string(), token.trim().to_string())
    } else {
        return Err(challenge());
    };

    let authorized = config.auth.tokens.iter().any(|token| {
        ring::constant_time::verify_slices_are_equal(token.as_bytes(), secret.as_bytes()).is_ok()
    });
    if authorized {
        Ok(principal)
    } else {
        Err(challenge())
    }
}

/// Hand a fully built wire body to hyper in bounded chunks, the way the
/// pack layer hands frames to the transport.
fn stream_body(mut bytes: bytes::Bytes) -> axum::body::Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::convert::Infallible>>(8);
    tokio::spawn(async move {
        while !bytes.is_empty() {
            let take = bytes.len().min(64 * 1024);
            let chunk = bytes.split_to(take);
            if tx.send(Ok(chunk)).await.is_err() {
                break;
            }
        }
    });
    axum::body::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
}

/// Error wrapper mapping protocol errors onto HTTP statuses.
pub struct AppError(pub ProtocolError);

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ProtocolError::InvalidService(_)
            | ProtocolError::InvalidRequest(_)
            | ProtocolError::Pack(_) => StatusCode::BAD_REQUEST,
            ProtocolError::RepositoryNotFound(_) | ProtocolError::ObjectNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ProtocolError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ProtocolError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ProtocolError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ProtocolError::Io(_) | ProtocolError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

/// When side-band was negotiated, breaches are reported on channel 3 with
/// the non-2xx status preserved.
fn side_band_error(smart: &SmartProtocol, err: ProtocolError) -> Response {
    let side_band = smart
        .capabilities
        .iter()
        .any(|c| matches!(c, crate::protocol::types::Capability::SideBand
            | crate::protocol::types::Capability::SideBand64k));
    if !side_band {
        return AppError(err).into_response();
    }
    let status = match &err {
        ProtocolError::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        ProtocolError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        _ => return AppError(err).into_response(),
    };
    let mut body = BytesMut::new();
    pkt::write_side_band(&mut body, SideBand::Error, format!("{err}\n").as_bytes());
    pkt::write_flush(&mut body);
    (status, body.freeze()).into_response()
}

#[derive(Debug, Deserialize)]
struct InfoRefsParams {
    service: String,
}

async fn info_refs(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    Query(params): Query<InfoRefsParams>,
) -> Result<Response, AppError> {
    let service: ServiceType = params.service.parse()?;
    let store = state.repos.open(&repo).await?;
    let smart = SmartProtocol::new(store, state.config.limits.clone());
    let body = smart.advertise_refs(service).await?;
    Ok((
        [(header::CONTENT_TYPE, service.advertisement_content_type())],
        body.freeze(),
    )
        .into_response())
}

async fn upload_pack(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let store = state.repos.open(&repo).await?;
    let mut smart = SmartProtocol::new(store, state.config.limits.clone());
    match smart.upload_pack(body).await {
        Ok(out) => Ok((
            [(
                header::CONTENT_TYPE,
                ServiceType::UploadPack.result_content_type(),
            )],
            stream_body(out.freeze()),
        )
            .into_response()),
        Err(err) => Ok(side_band_error(&smart, err)),
    }
}

async fn receive_pack(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let store = state.repos.open(&repo).await?;
    let mut smart = SmartProtocol::new(store, state.config.limits.clone());
    match smart.receive_pack(body).await {
        Ok(out) => Ok((
            [(
                header::CONTENT_TYPE,
                ServiceType::ReceivePack.result_content_type(),
            )],
            stream_body(out.freeze()),
        )
            .into_response()),
        Err(err) => Ok(side_band_error(&smart, err)),
    }
}

async fn lfs_batch(
    State(state): State<SharedState>,
    Path(repo): Path<String>,
    Json(request): Json<lfs::BatchRequest>,
) -> Result<Response, AppError> {
    let store = state.repos.open(&repo).await?;
    let response = lfs::batch(
        &*store.bucket_handle(),
        &store.config().repo_prefix,
        &repo,
        &state.config.external_base,
        &request,
    )
    .await
    .map_err(ProtocolError::from)?;
    Ok((
        [(header::CONTENT_TYPE, "application/vnd.git-lfs+json")],
        Json(response),
    )
        .into_response())
}

async fn lfs_download(
    State(state): State<SharedState>,
    Path((repo, oid)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let store = state.repos.open(&repo).await?;
    let key = lfs_keys::lfs_key(&store.config().repo_prefix, &oid);
    match store
        .bucket_handle()
        .get(&key)
        .await
        .map_err(ProtocolError::from)?
    {
        Some(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response()),
        None => Err(ProtocolError::ObjectNotFound(oid).into()),
    }
}

async fn lfs_upload(
    State(state): State<SharedState>,
    Path((repo, oid)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, AppError> {
    use sha2::{Digest, Sha256};
    let actual = hex::encode(Sha256::digest(&body));
    if actual != oid {
        return Err(ProtocolError::invalid_request(&format!(
            "body hashes to {actual}, not {oid}"
        ))
        .into());
    }
    let store = state.repos.open(&repo).await?;
    let key = lfs_keys::lfs_key(&store.config().repo_prefix, &oid);
    crate::storage::bucket::put_if_absent(&*store.bucket_handle(), &key, body)
        .await
        .map_err(ProtocolError::from)?;
    Ok(StatusCode::OK.into_response())
}

/// Convenience constructor used by the binary and the end-to-end tests.
pub fn app_state(
    bucket: Arc<dyn BucketStore>,
    data_dir: Option<PathBuf>,
    config: ServerConfig,
) -> SharedState {
    Arc::new(AppState {
        repos: RepoManager::new(bucket, data_dir, StoreConfig::default()),
        config,
        limiter: Arc::new(AllowAll),
    })
}
