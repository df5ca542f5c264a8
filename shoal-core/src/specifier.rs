//! The (hash, size, extension) triple that uniquely names an image.

use crate::error::{Result, ShoalError};
use crate::hash::ImageHash;
use crate::size::SizeSpec;
use std::fmt;
use std::str::FromStr;

/// Image formats the store accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    Jpg,
    Png,
    Gif,
}

impl Extension {
    pub fn from_mime(mime: &str) -> Result<Self> {
        match mime {
            "image/jpeg" => Ok(Extension::Jpg),
            "image/png" => Ok(Extension::Png),
            "image/gif" => Ok(Extension::Gif),
            other => Err(ShoalError::BadRequest(format!(
                "unsupported content type: {}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Jpg => "jpg",
            Extension::Png => "png",
            Extension::Gif => "gif",
        }
    }

    /// Content type renditions are served with. Gif renditions are
    /// encoded as PNG (there is no gif encoder on the resize path), so
    /// they are served as PNG as well.
    pub fn content_type(&self) -> &'static str {
        match self {
            Extension::Jpg => "image/jpeg",
            Extension::Png => "image/png",
            Extension::Gif => "image/png",
        }
    }
}

impl FromStr for Extension {
    type Err = ShoalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jpg" => Ok(Extension::Jpg),
            "png" => Ok(Extension::Png),
            "gif" => Ok(Extension::Gif),
            other => Err(ShoalError::BadRequest(format!(
                "unsupported extension: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combination of fields that uniquely specify an image rendition.
#[derive(Debug, Clone)]
pub struct ImageSpecifier {
    pub hash: ImageHash,
    pub size: SizeSpec,
    pub extension: Extension,
}

impl ImageSpecifier {
    pub fn new(hash: ImageHash, size: SizeSpec, extension: Extension) -> Self {
        Self {
            hash,
            size,
            extension,
        }
    }

    /// Key under which this rendition lives in the blob cache.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/image.{}", self.hash, self.size, self.extension)
    }
}
