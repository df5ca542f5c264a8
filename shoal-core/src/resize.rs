//! The resize worker pool.
//!
//! A fixed number of workers consume resize requests from one bounded
//! channel, so a burst of traffic queues instead of spawning unbounded
//! decoder work. For any output file at most one resize is in flight: a
//! per-output-path lock table serializes claimants, and whoever loses
//! the race finds the file already on disk and short-circuits.
//!
//! The codec itself is a collaborator behind the `Codec` trait. The
//! production implementation shells out to ImageMagick and writes the
//! output file itself; a codec may instead hand back encoded bytes, in
//! which case the submitter is responsible for persisting them.

use crate::error::{Result, ShoalError};
use crate::size::SizeSpec;
use crate::specifier::Extension;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Pending resize requests the pool will hold before submitters block.
const QUEUE_DEPTH: usize = 64;

/// What a codec produced for a resize.
pub enum CodecOutput {
    /// The codec wrote the output file itself.
    Written,
    /// The codec returned encoded bytes; the caller persists them.
    Encoded(Bytes),
}

#[async_trait]
pub trait Codec: Send + Sync {
    async fn resize(
        &self,
        source: &Path,
        output: &Path,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<CodecOutput>;
}

pub struct ResizeRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub extension: Extension,
    pub size: SizeSpec,
    pub reply: oneshot::Sender<ResizeResponse>,
}

#[derive(Debug, Clone)]
pub struct ResizeResponse {
    pub success: bool,
    /// True when the output file is already on disk (pre-existing or
    /// written by the codec); the caller reads it back instead of
    /// encoding.
    pub magick: bool,
    pub output: Option<Bytes>,
}

/// Per-output-path lock table. An entry lives only while some worker
/// holds or waits on it.
#[derive(Default)]
struct PathLocks {
    inner: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn acquire(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("path lock table poisoned");
        map.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release(&self, path: &Path) {
        let mut map = self.inner.lock().expect("path lock table poisoned");
        if let Some(lock) = map.get(path) {
            // One reference in the map and one in the releasing worker
            // means nobody is waiting.
            if Arc::strong_count(lock) <= 2 {
                map.remove(path);
            }
        }
    }
}

#[derive(Clone)]
pub struct ResizePool {
    tx: mpsc::Sender<ResizeRequest>,
}

impl ResizePool {
    /// Spawn `workers` tasks consuming from a shared bounded queue.
    pub fn start(workers: usize, codec: Arc<dyn Codec>) -> Self {
        let (tx, rx) = mpsc::channel::<ResizeRequest>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let locks = Arc::new(PathLocks::default());

        for worker_id in 0..workers.max(1) {
            let rx = rx.clone();
            let codec = codec.clone();
            let locks = locks.clone();
            tokio::spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    match request {
                        Some(request) => handle_request(request, &*codec, &locks).await,
                        None => break,
                    }
                }
                tracing::debug!("resize worker {} shutting down", worker_id);
            });
        }

        Self { tx }
    }

    /// Submit a resize and wait for the outcome. Blocks when the queue
    /// is full.
    pub async fn submit(
        &self,
        source_path: &Path,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<ResizeResponse> {
        let parent = source_path.parent().ok_or_else(|| {
            ShoalError::Internal(format!("source path {:?} has no parent", source_path))
        })?;
        let output_path = parent.join(format!("{}.{}", size, extension));

        let (reply, reply_rx) = oneshot::channel();
        let request = ResizeRequest {
            source_path: source_path.to_path_buf(),
            output_path,
            extension,
            size: *size,
            reply,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| ShoalError::Internal("resize pool is gone".to_string()))?;

        reply_rx
            .await
            .map_err(|_| ShoalError::Internal("resize worker dropped the reply".to_string()))
    }
}

async fn handle_request(request: ResizeRequest, codec: &dyn Codec, locks: &PathLocks) {
    let output_path = request.output_path.clone();
    let lock = locks.acquire(&output_path);
    let guard = lock.lock().await;

    let response = if file_is_nonempty(&output_path) {
        ResizeResponse {
            success: true,
            magick: true,
            output: None,
        }
    } else {
        match codec
            .resize(
                &request.source_path,
                &output_path,
                &request.size,
                request.extension,
            )
            .await
        {
            Ok(CodecOutput::Written) => ResizeResponse {
                success: true,
                magick: true,
                output: None,
            },
            Ok(CodecOutput::Encoded(bytes)) => ResizeResponse {
                success: true,
                magick: false,
                output: Some(bytes),
            },
            Err(error) => {
                tracing::warn!(
                    "resize of {:?} to {} failed: {}",
                    request.source_path,
                    request.size,
                    error
                );
                ResizeResponse {
                    success: false,
                    magick: false,
                    output: None,
                }
            }
        }
    };

    drop(guard);
    locks.release(&output_path);

    // The submitter may be gone; a dropped reply must not block the
    // worker.
    let _ = request.reply.send(response);
}

fn file_is_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// ImageMagick-backed codec. Writes the rendition itself (through a
/// tempfile so the output appears atomically) and reports `Written`.
pub struct MagickCodec;

#[async_trait]
impl Codec for MagickCodec {
    async fn resize(
        &self,
        source: &Path,
        output: &Path,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<CodecOutput> {
        let geometry = match size {
            SizeSpec::Full => {
                return Err(ShoalError::Internal(
                    "full-size rendition reached the codec".to_string(),
                ))
            }
            SizeSpec::Square(n) => vec![
                "-resize".to_string(),
                format!("{}x{}^", n, n),
                "-gravity".to_string(),
                "center".to_string(),
                "-extent".to_string(),
                format!("{}x{}", n, n),
            ],
            SizeSpec::Width(n) => vec!["-resize".to_string(), format!("{}x", n)],
            SizeSpec::Height(n) => vec!["-resize".to_string(), format!("x{}", n)],
        };

        let temp_path = output.with_extension("resize.tmp");
        // There is no gif encoder on this path; gif renditions come out
        // as png under the gif-named file.
        let dest_arg = match extension {
            Extension::Gif => format!("png:{}", temp_path.to_string_lossy()),
            _ => temp_path.to_string_lossy().to_string(),
        };

        run_magick(source, &geometry, &dest_arg).await?;
        tokio::fs::rename(&temp_path, output).await?;
        Ok(CodecOutput::Written)
    }
}

async fn run_magick(source: &Path, geometry: &[String], dest_arg: &str) -> Result<()> {
    for binary in ["magick", "convert"] {
        let output = tokio::process::Command::new(binary)
            .arg(source)
            .args(geometry)
            .arg(dest_arg)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => return Ok(()),
            Ok(output) => {
                return Err(ShoalError::ResizeFailed(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        }
    }
    Err(ShoalError::ResizeFailed(
        "no imagemagick binary on PATH".to_string(),
    ))
}
