//! Peer records and the HTTP client used to talk to them.
//!
//! A `Node` is what we know about a single participant (ourself or
//! another): identity, endpoint, and liveness. Liveness fields are only
//! ever mutated through the owning `Cluster`, which serializes updates;
//! the `PeerClient` reports outcomes and leaves the bookkeeping to it.

use crate::error::{Result, ShoalError};
use crate::hash::ImageHash;
use crate::size::SizeSpec;
use crate::specifier::Extension;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-request timeout for peer RPCs. A peer that cannot answer within
/// this window is treated as failed and the caller moves on.
const PEER_TIMEOUT: Duration = Duration::from_secs(5);

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// What we know about a single node, ourself or another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub nickname: String,
    pub uuid: String,
    pub base_url: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub writeable: bool,
    #[serde(default = "epoch")]
    pub last_seen: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub last_failed: DateTime<Utc>,
}

impl Node {
    pub fn new(nickname: &str, uuid: &str, base_url: &str, location: &str, writeable: bool) -> Self {
        Self {
            nickname: nickname.to_string(),
            uuid: uuid.to_string(),
            base_url: base_url.to_string(),
            location: location.to_string(),
            writeable,
            last_seen: epoch(),
            last_failed: epoch(),
        }
    }

    /// A node is current when it has answered more recently than it has
    /// failed.
    pub fn is_current(&self) -> bool {
        self.last_seen > self.last_failed
    }

    pub fn retrieve_url(&self, hash: &ImageHash, size: &SizeSpec, extension: Extension) -> String {
        format!(
            "http://{}/retrieve/{}/{}/{}/",
            self.base_url, hash, size, extension
        )
    }

    pub fn retrieve_info_url(&self, hash: &ImageHash, extension: Extension) -> String {
        format!(
            "http://{}/retrieve_info/{}/x/{}/",
            self.base_url, hash, extension
        )
    }

    pub fn stash_url(&self) -> String {
        format!("http://{}/stash/", self.base_url)
    }

    pub fn announce_url(&self) -> String {
        format!("http://{}/announce/", self.base_url)
    }
}

/// Answer to a `retrieve_info` probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub hash: String,
    pub extension: String,
    pub local: bool,
}

/// HTTP client for peer RPCs. Stateless; the `Cluster` applies liveness
/// updates based on the outcomes it returns.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl PeerClient {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .map_err(|error| ShoalError::Http(error.to_string()))?;
        Ok(Self { http })
    }

    /// Ask a peer for an image. `Ok(Some(bytes))` on a 2xx, `Ok(None)`
    /// when the peer answered but does not have it, `Err` on transport
    /// failure.
    pub async fn retrieve(
        &self,
        node: &Node,
        hash: &ImageHash,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<Option<Bytes>> {
        let url = node.retrieve_url(hash, size, extension);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| ShoalError::PeerUnavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|error| ShoalError::PeerUnavailable(error.to_string()))?;
        Ok(Some(bytes))
    }

    /// Push a local file to a peer as a multipart `image` field.
    pub async fn stash(&self, node: &Node, local_path: &Path) -> Result<()> {
        let contents = tokio::fs::read(local_path).await?;
        let filename = local_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());

        let part = reqwest::multipart::Part::bytes(contents).file_name(filename);
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .http
            .post(node.stash_url())
            .multipart(form)
            .send()
            .await
            .map_err(|error| ShoalError::PeerUnavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Err(ShoalError::PeerUnavailable(format!(
                "stash to {} answered {}",
                node.uuid,
                response.status()
            )));
        }
        Ok(())
    }

    /// Ask a peer whether it holds the full-size blob.
    pub async fn retrieve_info(
        &self,
        node: &Node,
        hash: &ImageHash,
        extension: Extension,
    ) -> Result<Option<ImageInfo>> {
        let url = node.retrieve_info_url(hash, extension);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|error| ShoalError::PeerUnavailable(error.to_string()))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let info = response
            .json::<ImageInfo>()
            .await
            .map_err(|error| ShoalError::PeerUnavailable(error.to_string()))?;
        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_is_not_current() {
        let node = Node::new("a", "uuid-a", "localhost:8080", "", true);
        assert!(!node.is_current());
    }

    #[test]
    fn seen_after_failure_is_current() {
        let mut node = Node::new("a", "uuid-a", "localhost:8080", "", true);
        node.last_failed = Utc::now();
        node.last_seen = node.last_failed + chrono::Duration::seconds(1);
        assert!(node.is_current());
    }

    #[test]
    fn url_shapes() {
        let node = Node::new("a", "uuid-a", "localhost:8080", "", true);
        let hash = ImageHash::of_bytes(b"x");
        assert_eq!(
            node.retrieve_url(&hash, &SizeSpec::Square(100), Extension::Jpg),
            format!("http://localhost:8080/retrieve/{}/100s/jpg/", hash)
        );
        assert_eq!(node.stash_url(), "http://localhost:8080/stash/");
        assert_eq!(
            node.retrieve_info_url(&hash, Extension::Png),
            format!("http://localhost:8080/retrieve_info/{}/x/png/", hash)
        );
    }
}
