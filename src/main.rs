use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use chunkpipe::{
    BackupPipeline, DirFolder, Error, Processor, RestorePipeline, SealedProcessor, ZstdProcessor,
};
use futures_util::{Stream, StreamExt, TryStreamExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_MAX_OBJECT_SIZE: usize = 100 * 1024 * 1024;

struct Config {
    root: PathBuf,
    addr: SocketAddr,
    max_object_size: usize,
    key: Option<[u8; 32]>,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let root = std::env::var("CHUNKPIPE_ROOT").unwrap_or_else(|_| "./backups".into());
        let addr = match std::env::var("CHUNKPIPE_ADDR") {
            Ok(addr) => addr.parse().context("invalid CHUNKPIPE_ADDR")?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 3000)),
        };
        let max_object_size = match std::env::var("CHUNKPIPE_MAX_OBJECT_SIZE") {
            Ok(size) => size.parse().context("invalid CHUNKPIPE_MAX_OBJECT_SIZE")?,
            Err(_) => DEFAULT_MAX_OBJECT_SIZE,
        };
        let key = match std::env::var("CHUNKPIPE_KEY") {
            Ok(hex) => {
                let mut key = [0; 32];
                let decoded = base16ct::mixed::decode(hex.trim(), &mut key)
                    .map_err(|_| anyhow!("CHUNKPIPE_KEY is not valid hex"))?;
                if decoded.len() != key.len() {
                    return Err(anyhow!("CHUNKPIPE_KEY must be 64 hex characters"));
                }
                Some(key)
            }
            Err(_) => None,
        };

        Ok(Self {
            root: root.into(),
            addr,
            max_object_size,
            key,
        })
    }
}

/// zstd, sealed with AES-256-GCM when a key is configured.
enum Codec {
    Plain(ZstdProcessor),
    Sealed(SealedProcessor<ZstdProcessor>),
}

impl Processor for Codec {
    fn forward(&self, raw: &[u8]) -> chunkpipe::Result<Vec<u8>> {
        match self {
            Self::Plain(p) => p.forward(raw),
            Self::Sealed(p) => p.forward(raw),
        }
    }

    fn reverse(&self, stored: &[u8]) -> chunkpipe::Result<Vec<u8>> {
        match self {
            Self::Plain(p) => p.reverse(stored),
            Self::Sealed(p) => p.reverse(stored),
        }
    }

    fn max_expansion(&self, raw_len: usize) -> usize {
        match self {
            Self::Plain(p) => p.max_expansion(raw_len),
            Self::Sealed(p) => p.max_expansion(raw_len),
        }
    }
}

struct AppState {
    root: PathBuf,
    max_object_size: usize,
    codec: Arc<Codec>,
}

impl AppState {
    fn folder(&self, name: &str) -> Result<DirFolder, AppError> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(AppError(Error::InvalidConfig {
                reason: format!("`{name}` is not a valid folder name"),
            }));
        }
        Ok(DirFolder::new(self.root.join(name), self.max_object_size))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chunkpipe=info")),
        )
        .init();

    let config = Config::from_env()?;
    let zstd = ZstdProcessor::default().with_max_raw_len(config.max_object_size);
    let codec = match config.key {
        Some(key) => Codec::Sealed(SealedProcessor::new(zstd, &key)),
        None => {
            tracing::warn!("CHUNKPIPE_KEY is not set, backups are stored unencrypted");
            Codec::Plain(zstd)
        }
    };
    let state = Arc::new(AppState {
        root: config.root,
        max_object_size: config.max_object_size,
        codec: Arc::new(codec),
    });

    let app = Router::new()
        .route("/{folder}", post(upload_backup).get(download_backup))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    tracing::info!(addr = %config.addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn upload_backup(
    State(state): State<Arc<AppState>>,
    Path(folder): Path<String>,
    body: Body,
) -> Result<String, AppError> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let read = StreamReader::new(stream);

    let folder = state.folder(&folder)?;
    let folder = DirFolder::create(folder.root(), state.max_object_size).await?;
    let summary = BackupPipeline::new(Arc::new(folder), Arc::clone(&state.codec))
        .backup(read)
        .await?;

    Ok(format!(
        "{}: {} chunks, {} bytes, {} stored\n",
        summary.run, summary.chunks, summary.bytes_read, summary.bytes_stored
    ))
}

async fn download_backup(
    State(state): State<Arc<AppState>>,
    Path(folder): Path<String>,
) -> Result<Body, AppError> {
    let folder = state.folder(&folder)?;
    let pipeline = RestorePipeline::new(Arc::new(folder), Arc::clone(&state.codec));

    Ok(Body::from_stream(restore_stream(pipeline)))
}

/// Streams a restore as a response body.
///
/// A failed restore ends the stream with an error, which aborts the response
/// instead of passing off a truncated body as complete.
fn restore_stream(
    pipeline: RestorePipeline<DirFolder, Codec>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let restore = tokio::spawn(async move { pipeline.restore(writer).await });

    async_stream::try_stream! {
        let mut chunks = ReaderStream::new(reader);
        while let Some(bytes) = chunks.next().await {
            yield bytes?;
        }
        restore
            .await
            .map_err(std::io::Error::other)?
            .map_err(std::io::Error::other)?;
    }
}

struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::FolderNotEmpty { .. } => StatusCode::CONFLICT,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidConfig { .. } | Error::Io(_) => StatusCode::BAD_REQUEST,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(err = %self.0, %status, "request failed");
        (status, format!("{}\n", self.0)).into_response()
    }
}
