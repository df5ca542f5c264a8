//! Read/write orchestration over the store, the cluster, and the pool.
//!
//! Uploads are hashed, written locally, then fanned out to peers.
//! Reads check the blob cache, then the rendition on disk, then the
//! full-size (resizing on demand), and finally fall back to the
//! cluster; a blob fetched from a peer is served but never persisted,
//! because this node is not one of its replicas.

use crate::blob_store::BlobStore;
use crate::cache::RenditionCache;
use crate::cluster::Cluster;
use crate::error::{Result, ShoalError};
use crate::hash::ImageHash;
use crate::node::ImageInfo;
use crate::resize::ResizePool;
use crate::specifier::{Extension, ImageSpecifier};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// What an upload reports back to the client.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub hash: String,
    pub length: usize,
    pub extension: String,
    pub full_url: String,
    pub satisfied: bool,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServedImage {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

pub struct Coordinator {
    store: Arc<BlobStore>,
    cluster: Arc<Cluster>,
    pool: ResizePool,
    cache: Option<Arc<dyn RenditionCache>>,
    replication: usize,
    min_replication: usize,
}

impl Coordinator {
    pub fn new(
        store: Arc<BlobStore>,
        cluster: Arc<Cluster>,
        pool: ResizePool,
        cache: Option<Arc<dyn RenditionCache>>,
        replication: usize,
        min_replication: usize,
    ) -> Self {
        Self {
            store,
            cluster,
            pool,
            cache,
            replication,
            min_replication,
        }
    }

    /// Accept an upload: hash it, store the full-size locally, then
    /// replicate to peers. The local copy counts toward replication.
    pub async fn add_image(&self, bytes: Bytes, extension: Extension) -> Result<UploadReport> {
        let hash = ImageHash::of_bytes(&bytes);
        let path = self.store.write_full(&hash, extension, &bytes).await?;

        let nodes = self.cluster.stash(&hash, &path, self.replication).await;
        let satisfied = nodes.len() + 1 >= self.min_replication;
        if !satisfied {
            tracing::warn!(
                "upload {} reached {} of {} copies",
                hash,
                nodes.len() + 1,
                self.min_replication
            );
        }

        Ok(UploadReport {
            hash: hash.to_string(),
            length: bytes.len(),
            extension: extension.to_string(),
            full_url: format!("/image/{}/full/image.{}", hash, extension),
            satisfied,
            nodes,
        })
    }

    /// Serve an image, consulting in order: the blob cache, the
    /// rendition on disk, the local full-size (resizing on demand), and
    /// finally the rest of the cluster.
    pub async fn serve_image(&self, spec: &ImageSpecifier) -> Result<ServedImage> {
        let key = spec.cache_key();
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(&key).await {
                return Ok(ServedImage {
                    bytes,
                    content_type: spec.extension.content_type(),
                });
            }
        }

        if let Some(image) = self.render_local(spec).await? {
            if let Some(cache) = &self.cache {
                cache.set(&key, image.bytes.clone()).await;
            }
            return Ok(image);
        }

        // Not on this node. Another replica may have it; serve what it
        // gives us but do not keep a copy, we are not a replica.
        let bytes = self
            .cluster
            .retrieve(&spec.hash, &spec.size, spec.extension)
            .await?;
        Ok(ServedImage {
            bytes,
            content_type: spec.extension.content_type(),
        })
    }

    /// Serve from local disk only; peers call this through `/retrieve/`
    /// and a miss here must not cascade back into the cluster.
    pub async fn retrieve_local(&self, spec: &ImageSpecifier) -> Result<ServedImage> {
        self.render_local(spec)
            .await?
            .ok_or_else(|| ShoalError::NotFound(format!("{} not on this node", spec.hash)))
    }

    /// Accept a stash from a peer.
    pub async fn stash_image(&self, bytes: Bytes, extension: Extension) -> Result<ImageHash> {
        if !self.cluster.myself_is_writeable().await {
            return Err(ShoalError::NotWriteable);
        }
        let hash = ImageHash::of_bytes(&bytes);
        self.store.write_full(&hash, extension, &bytes).await?;
        Ok(hash)
    }

    pub async fn image_info(&self, hash: &ImageHash, extension: Extension) -> ImageInfo {
        ImageInfo {
            hash: hash.to_string(),
            extension: extension.to_string(),
            local: self.store.has_full(hash, extension),
        }
    }

    async fn render_local(&self, spec: &ImageSpecifier) -> Result<Option<ServedImage>> {
        if let Ok(bytes) = self
            .store
            .lookup_rendition(&spec.hash, &spec.size, spec.extension)
            .await
        {
            return Ok(Some(ServedImage {
                bytes,
                content_type: spec.extension.content_type(),
            }));
        }

        if !self.store.has_full(&spec.hash, spec.extension) {
            return Ok(None);
        }

        // Full-size present, rendition missing: resize, cache, serve.
        let full_path = self.store.full_path(&spec.hash, spec.extension);
        let response = self
            .pool
            .submit(&full_path, &spec.size, spec.extension)
            .await?;

        if !response.success {
            return Err(ShoalError::ResizeFailed(format!(
                "{} to {}",
                spec.hash, spec.size
            )));
        }

        if response.magick {
            let bytes = self
                .store
                .lookup_rendition(&spec.hash, &spec.size, spec.extension)
                .await?;
            return Ok(Some(ServedImage {
                bytes,
                content_type: spec.extension.content_type(),
            }));
        }

        let bytes = response.output.ok_or_else(|| {
            ShoalError::Internal("resize succeeded but produced no output".to_string())
        })?;
        // A failed rendition write is not fatal; we just cannot cache it.
        if let Err(error) = self
            .store
            .write_rendition(&spec.hash, &spec.size, spec.extension, &bytes)
            .await
        {
            tracing::warn!("could not cache rendition {}/{}: {}", spec.hash, spec.size, error);
        }
        Ok(Some(ServedImage {
            bytes,
            content_type: spec.extension.content_type(),
        }))
    }
}
