//! Content-addressed filesystem layout.
//!
//! Blobs live under the upload directory at the path derived from their
//! hash: `<root>/<ab>/<cd>/.../full.<ext>` for the full-size and
//! `<root>/<ab>/<cd>/.../<size>.<ext>` for renditions. Writes land in a
//! sibling tempfile and are renamed into place, so a partially written
//! rendition is never visible to readers.

use crate::error::{Result, ShoalError};
use crate::hash::ImageHash;
use crate::size::SizeSpec;
use crate::specifier::Extension;
use bytes::Bytes;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, hash: &ImageHash, extension: Extension) -> PathBuf {
        self.root
            .join(hash.as_path())
            .join(format!("full.{}", extension))
    }

    pub fn rendition_path(
        &self,
        hash: &ImageHash,
        size: &SizeSpec,
        extension: Extension,
    ) -> PathBuf {
        self.root
            .join(hash.as_path())
            .join(format!("{}.{}", size, extension))
    }

    pub async fn lookup_full(&self, hash: &ImageHash, extension: Extension) -> Result<Bytes> {
        read_blob(&self.full_path(hash, extension)).await
    }

    pub async fn lookup_rendition(
        &self,
        hash: &ImageHash,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<Bytes> {
        read_blob(&self.rendition_path(hash, size, extension)).await
    }

    pub fn has_full(&self, hash: &ImageHash, extension: Extension) -> bool {
        self.full_path(hash, extension).is_file()
    }

    /// Write (or overwrite) the full-size blob, returning its path.
    pub async fn write_full(
        &self,
        hash: &ImageHash,
        extension: Extension,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.full_path(hash, extension);
        self.write_blob(&path, bytes).await?;
        tracing::debug!("stored full-size {} at {:?}", hash, path);
        Ok(path)
    }

    pub async fn write_rendition(
        &self,
        hash: &ImageHash,
        size: &SizeSpec,
        extension: Extension,
        bytes: &[u8],
    ) -> Result<PathBuf> {
        let path = self.rendition_path(hash, size, extension);
        self.write_blob(&path, bytes).await?;
        tracing::debug!("cached rendition {}/{} at {:?}", hash, size, path);
        Ok(path)
    }

    async fn write_blob(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| ShoalError::Internal(format!("blob path {:?} has no parent", path)))?;
        fs::create_dir_all(parent).await?;

        // mkdir and open both honor the process umask; the on-disk
        // contract is 0755 directories and 0644 files.
        for dir in parent.ancestors() {
            if !dir.starts_with(&self.root) || dir == self.root {
                break;
            }
            fs::set_permissions(dir, Permissions::from_mode(DIR_MODE)).await?;
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| ShoalError::Internal(format!("blob path {:?} has no file name", path)))?;
        let temp_path = parent.join(format!("{}.tmp", file_name.to_string_lossy()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::set_permissions(&temp_path, Permissions::from_mode(FILE_MODE)).await?;
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

async fn read_blob(path: &Path) -> Result<Bytes> {
    if !path.is_file() {
        return Err(ShoalError::NotFound(path.to_string_lossy().to_string()));
    }
    let data = fs::read(path).await?;
    Ok(Bytes::from(data))
}
