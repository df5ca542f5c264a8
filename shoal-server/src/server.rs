use crate::config::Config;
use crate::gossip;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use shoal_core::{
    AnnounceUpdate, BlobStore, Cluster, Codec, Coordinator, Extension, ImageHash, ImageSpecifier,
    MagickCodec, RenditionCache, ResizePool, Result, ServedImage, ShoalError, SizeSpec,
};
use std::sync::Arc;

/// Largest multipart body the upload endpoints will accept.
const UPLOAD_LIMIT: usize = 64 * 1024 * 1024;

pub struct ServerState {
    pub coordinator: Coordinator,
    pub cluster: Arc<Cluster>,
    pub config: Config,
}

/// Wire the cluster, blob store, resize pool, and coordinator from a
/// loaded config.
pub async fn build_state(
    config: Config,
    codec: Arc<dyn Codec>,
    cache: Option<Arc<dyn RenditionCache>>,
) -> Result<Arc<ServerState>> {
    let cluster = Arc::new(Cluster::new(config.my_node.to_node())?);
    for neighbor in &config.neighbors {
        cluster.add_neighbor(neighbor.to_node()).await;
    }

    let store = Arc::new(BlobStore::new(&config.upload_directory));
    let pool = ResizePool::start(config.num_resize_workers, codec);
    let coordinator = Coordinator::new(
        store,
        cluster.clone(),
        pool,
        cache,
        config.replication,
        config.min_replication,
    );

    Ok(Arc::new(ServerState {
        coordinator,
        cluster,
        config,
    }))
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", post(add_image))
        .route("/image/:hash/:size/:filename", get(serve_image))
        .route("/image/:hash/:size/", get(serve_image_default))
        .route("/stash/", post(stash_image))
        .route("/retrieve/:hash/:size/:ext/", get(retrieve_image))
        .route("/retrieve_info/:hash/:marker/:ext/", get(retrieve_info))
        .route("/announce/", post(announce))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT))
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    let port = config.port;
    let gossiper_sleep = config.gossiper_sleep;
    let state = build_state(config, Arc::new(MagickCodec), None).await?;

    tokio::spawn(gossip::announce_loop(state.cluster.clone(), gossiper_sleep));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("Server listening on port {}", port);
    axum::serve(listener, app).await?;

    Ok(())
}

fn error_response(error: ShoalError) -> Response {
    let status = match &error {
        ShoalError::MalformedHash(_) | ShoalError::NotFound(_) | ShoalError::BadRequest(_) => {
            StatusCode::NOT_FOUND
        }
        ShoalError::NotWriteable => StatusCode::BAD_REQUEST,
        ShoalError::Unauthorized(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}

fn image_response(image: ServedImage) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, image.content_type)],
        image.bytes,
    )
        .into_response()
}

fn parse_specifier(hash: &str, size: &str, extension: &str) -> Result<ImageSpecifier> {
    let hash = ImageHash::from_hex(hash)?;
    let size = size.parse::<SizeSpec>()?;
    let extension = extension.parse::<Extension>()?;
    Ok(ImageSpecifier::new(hash, size, extension))
}

async fn add_image(State(state): State<Arc<ServerState>>, mut multipart: Multipart) -> Response {
    let mut image: Option<(Bytes, Option<String>)> = None;
    let mut key = String::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => return error_response(ShoalError::BadRequest(error.to_string())),
        };
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(data) => image = Some((data, content_type)),
                    Err(error) => {
                        return error_response(ShoalError::BadRequest(error.to_string()))
                    }
                }
            }
            Some("key") => key = field.text().await.unwrap_or_default(),
            _ => {}
        }
    }

    if state.config.key_required() && !state.config.valid_key(&key) {
        return error_response(ShoalError::Unauthorized("invalid upload key".to_string()));
    }

    let Some((data, content_type)) = image else {
        return error_response(ShoalError::BadRequest("no image field".to_string()));
    };
    let extension = match content_type.as_deref().map(Extension::from_mime) {
        Some(Ok(extension)) => extension,
        _ => {
            return error_response(ShoalError::BadRequest(
                "missing or unsupported content type".to_string(),
            ))
        }
    };

    match state.coordinator.add_image(data, extension).await {
        Ok(report) => Json(report).into_response(),
        Err(error) => error_response(error),
    }
}

async fn serve_image(
    State(state): State<Arc<ServerState>>,
    Path((hash, size, filename)): Path<(String, String, String)>,
) -> Response {
    serve_named(state, hash, size, filename).await
}

async fn serve_image_default(
    State(state): State<Arc<ServerState>>,
    Path((hash, size)): Path<(String, String)>,
) -> Response {
    serve_named(state, hash, size, "image.jpg".to_string()).await
}

async fn serve_named(
    state: Arc<ServerState>,
    hash: String,
    size: String,
    filename: String,
) -> Response {
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    let spec = match parse_specifier(&hash, &size, extension) {
        Ok(spec) => spec,
        Err(error) => return error_response(error),
    };
    match state.coordinator.serve_image(&spec).await {
        Ok(image) => image_response(image),
        Err(error) => error_response(error),
    }
}

async fn stash_image(State(state): State<Arc<ServerState>>, mut multipart: Multipart) -> Response {
    let mut image: Option<(Bytes, Option<String>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(error) => return error_response(ShoalError::BadRequest(error.to_string())),
        };
        if field.name() == Some("image") {
            let file_name = field.file_name().map(str::to_string);
            match field.bytes().await {
                Ok(data) => image = Some((data, file_name)),
                Err(error) => return error_response(ShoalError::BadRequest(error.to_string())),
            }
        }
    }

    let Some((data, file_name)) = image else {
        return error_response(ShoalError::BadRequest("no image field".to_string()));
    };
    let extension = file_name
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.parse::<Extension>());
    let extension = match extension {
        Some(Ok(extension)) => extension,
        _ => {
            return error_response(ShoalError::BadRequest(
                "missing or unsupported extension".to_string(),
            ))
        }
    };

    match state.coordinator.stash_image(data, extension).await {
        Ok(hash) => {
            tracing::debug!("stashed {} for a peer", hash);
            (StatusCode::OK, "ok").into_response()
        }
        Err(error) => error_response(error),
    }
}

async fn retrieve_image(
    State(state): State<Arc<ServerState>>,
    Path((hash, size, extension)): Path<(String, String, String)>,
) -> Response {
    let spec = match parse_specifier(&hash, &size, &extension) {
        Ok(spec) => spec,
        Err(error) => return error_response(error),
    };
    match state.coordinator.retrieve_local(&spec).await {
        Ok(image) => image_response(image),
        Err(error) => error_response(error),
    }
}

async fn retrieve_info(
    State(state): State<Arc<ServerState>>,
    Path((hash, marker, extension)): Path<(String, String, String)>,
) -> Response {
    // The probe path carries a literal `x` where image URLs carry a
    // size; anything else is a malformed URL.
    if marker != "x" {
        return error_response(ShoalError::BadRequest(format!(
            "expected x, got {}",
            marker
        )));
    }
    let hash = match ImageHash::from_hex(&hash) {
        Ok(hash) => hash,
        Err(error) => return error_response(error),
    };
    let extension = match extension.parse::<Extension>() {
        Ok(extension) => extension,
        Err(error) => return error_response(error),
    };
    Json(state.coordinator.image_info(&hash, extension).await).into_response()
}

#[derive(Debug, Deserialize)]
struct AnnounceForm {
    uuid: Option<String>,
    nickname: Option<String>,
    location: Option<String>,
    base_url: Option<String>,
    writeable: Option<String>,
}

async fn announce(
    State(state): State<Arc<ServerState>>,
    Form(form): Form<AnnounceForm>,
) -> Response {
    if let Some(uuid) = form.uuid.filter(|v| !v.is_empty()) {
        state
            .cluster
            .apply_announce(AnnounceUpdate {
                uuid,
                nickname: form.nickname,
                location: form.location,
                base_url: form.base_url,
                writeable: form.writeable.as_deref().map(|v| v == "true"),
            })
            .await;
    }
    Json(state.cluster.announce_response().await).into_response()
}
