//! Cluster membership and placement.
//!
//! The `Cluster` owns the local node ("myself") and every neighbor we
//! know about, and answers the one question the rest of the system keeps
//! asking: for this hash, which nodes are responsible, and in what
//! order? Writes replicate down that order; reads walk it until a peer
//! answers.
//!
//! Membership only grows at runtime. All mutation goes through the
//! single lock here; placement copies a snapshot out and never holds the
//! lock across network I/O.

use crate::error::{Result, ShoalError};
use crate::hash::{ring_keys, ImageHash, REPLICAS};
use crate::node::{Node, PeerClient};
use crate::size::SizeSpec;
use crate::specifier::Extension;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::sync::RwLock;

struct ClusterState {
    myself: Node,
    neighbors: Vec<Node>,
}

pub struct Cluster {
    state: RwLock<ClusterState>,
    client: PeerClient,
}

/// Fields a peer may carry in an announce. Empty strings are treated as
/// absent; only present fields overwrite the stored record.
#[derive(Debug, Clone, Default)]
pub struct AnnounceUpdate {
    pub uuid: String,
    pub nickname: Option<String>,
    pub location: Option<String>,
    pub base_url: Option<String>,
    pub writeable: Option<bool>,
}

/// What a node answers to an announce: its own record plus everyone it
/// knows about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceResponse {
    pub nickname: String,
    pub uuid: String,
    pub location: String,
    pub writeable: bool,
    pub base_url: String,
    pub neighbors: Vec<Node>,
}

impl Cluster {
    pub fn new(myself: Node) -> Result<Self> {
        Ok(Self {
            state: RwLock::new(ClusterState {
                myself,
                neighbors: Vec::new(),
            }),
            client: PeerClient::new()?,
        })
    }

    pub async fn myself(&self) -> Node {
        self.state.read().await.myself.clone()
    }

    pub async fn myself_is_writeable(&self) -> bool {
        self.state.read().await.myself.writeable
    }

    pub async fn neighbors(&self) -> Vec<Node> {
        self.state.read().await.neighbors.clone()
    }

    pub async fn find_neighbor_by_uuid(&self, uuid: &str) -> Option<Node> {
        self.state
            .read()
            .await
            .neighbors
            .iter()
            .find(|node| node.uuid == uuid)
            .cloned()
    }

    /// Add a neighbor if its uuid is unknown. Our own uuid is never a
    /// neighbor.
    pub async fn add_neighbor(&self, node: Node) {
        let mut state = self.state.write().await;
        if node.uuid == state.myself.uuid {
            return;
        }
        if state.neighbors.iter().any(|n| n.uuid == node.uuid) {
            return;
        }
        tracing::info!("adding neighbor {} ({})", node.nickname, node.uuid);
        state.neighbors.push(node);
    }

    /// Overwrite the record with a matching uuid.
    pub async fn update_neighbor(&self, node: Node) -> Result<()> {
        let mut state = self.state.write().await;
        match state.neighbors.iter_mut().find(|n| n.uuid == node.uuid) {
            Some(existing) => {
                *existing = node;
                Ok(())
            }
            None => Err(ShoalError::NotFound(format!(
                "no neighbor with uuid {}",
                node.uuid
            ))),
        }
    }

    pub async fn mark_seen(&self, uuid: &str) {
        let mut state = self.state.write().await;
        if let Some(node) = state.neighbors.iter_mut().find(|n| n.uuid == uuid) {
            node.last_seen = Utc::now();
        }
    }

    pub async fn mark_failed(&self, uuid: &str) {
        let mut state = self.state.write().await;
        if let Some(node) = state.neighbors.iter_mut().find(|n| n.uuid == uuid) {
            node.last_failed = Utc::now();
        }
    }

    /// A failed stash takes the peer out of the write ring until it
    /// announces again.
    async fn mark_stash_failed(&self, uuid: &str) {
        let mut state = self.state.write().await;
        if let Some(node) = state.neighbors.iter_mut().find(|n| n.uuid == uuid) {
            node.last_failed = Utc::now();
            node.writeable = false;
        }
    }

    /// Apply an inbound announce: update the known record's present
    /// fields, or add a new neighbor.
    pub async fn apply_announce(&self, update: AnnounceUpdate) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        if update.uuid.is_empty() || update.uuid == state.myself.uuid {
            return;
        }

        if let Some(existing) = state
            .neighbors
            .iter_mut()
            .find(|n| n.uuid == update.uuid)
        {
            if let Some(nickname) = update.nickname.filter(|v| !v.is_empty()) {
                existing.nickname = nickname;
            }
            if let Some(location) = update.location.filter(|v| !v.is_empty()) {
                existing.location = location;
            }
            if let Some(base_url) = update.base_url.filter(|v| !v.is_empty()) {
                existing.base_url = base_url;
            }
            if let Some(writeable) = update.writeable {
                existing.writeable = writeable;
            }
            existing.last_seen = now;
            return;
        }

        let mut node = Node::new(
            update.nickname.as_deref().unwrap_or_default(),
            &update.uuid,
            update.base_url.as_deref().unwrap_or_default(),
            update.location.as_deref().unwrap_or_default(),
            update.writeable.unwrap_or(false),
        );
        node.last_seen = now;
        tracing::info!("adding neighbor {} from announce", node.uuid);
        state.neighbors.push(node);
    }

    /// Merge a neighbor list learned from a peer. Unknown uuids become
    /// neighbors; for known ones the record with the more recent
    /// `last_seen` wins. Myself is never merged.
    pub async fn merge_neighbors(&self, records: Vec<Node>) {
        let mut state = self.state.write().await;
        for record in records {
            if record.uuid.is_empty() || record.uuid == state.myself.uuid {
                continue;
            }
            match state.neighbors.iter_mut().find(|n| n.uuid == record.uuid) {
                Some(existing) => {
                    if record.last_seen > existing.last_seen {
                        *existing = record;
                    }
                }
                None => {
                    tracing::info!("learned neighbor {} via gossip", record.uuid);
                    state.neighbors.push(record);
                }
            }
        }
    }

    pub async fn announce_response(&self) -> AnnounceResponse {
        let state = self.state.read().await;
        AnnounceResponse {
            nickname: state.myself.nickname.clone(),
            uuid: state.myself.uuid.clone(),
            location: state.myself.location.clone(),
            writeable: state.myself.writeable,
            base_url: state.myself.base_url.clone(),
            neighbors: state.neighbors.clone(),
        }
    }

    /// The ordered list of candidate nodes for a hash: myself and every
    /// neighbor, walked clockwise around the ring from the hash's
    /// position, each node emitted once.
    pub async fn read_order(&self, hash: &ImageHash) -> Vec<Node> {
        let candidates: Vec<Node> = {
            let state = self.state.read().await;
            std::iter::once(state.myself.clone())
                .chain(state.neighbors.iter().cloned())
                .collect()
        };
        ring_order(&candidates, hash)
    }

    /// `read_order` restricted to nodes that accept stash requests.
    pub async fn write_order(&self, hash: &ImageHash) -> Vec<Node> {
        self.read_order(hash)
            .await
            .into_iter()
            .filter(|node| node.writeable)
            .collect()
    }

    /// Replicate a locally stored blob to peers, in write order, until
    /// `replication - 1` remote copies exist (the local copy counts).
    /// Returns the uuids that accepted the stash; running out of
    /// candidates is not an error, just fewer copies.
    pub async fn stash(
        &self,
        hash: &ImageHash,
        local_path: &Path,
        replication: usize,
    ) -> Vec<String> {
        let myself_uuid = self.myself().await.uuid;
        let needed = replication.saturating_sub(1);
        let mut saved = Vec::new();

        for node in self.write_order(hash).await {
            if node.uuid == myself_uuid {
                continue;
            }
            if saved.len() >= needed {
                break;
            }
            match self.client.stash(&node, local_path).await {
                Ok(()) => {
                    self.mark_seen(&node.uuid).await;
                    saved.push(node.uuid);
                }
                Err(error) => {
                    tracing::warn!("stash of {} to {} failed: {}", hash, node.uuid, error);
                    self.mark_stash_failed(&node.uuid).await;
                }
            }
        }

        saved
    }

    /// Walk the read order asking peers for an image; first answer wins.
    pub async fn retrieve(
        &self,
        hash: &ImageHash,
        size: &SizeSpec,
        extension: Extension,
    ) -> Result<Bytes> {
        let myself_uuid = self.myself().await.uuid;

        for node in self.read_order(hash).await {
            if node.uuid == myself_uuid {
                continue;
            }
            match self.client.retrieve(&node, hash, size, extension).await {
                Ok(Some(bytes)) => {
                    self.mark_seen(&node.uuid).await;
                    return Ok(bytes);
                }
                Ok(None) => {
                    self.mark_seen(&node.uuid).await;
                }
                Err(error) => {
                    tracing::debug!("retrieve of {} from {} failed: {}", hash, node.uuid, error);
                    self.mark_failed(&node.uuid).await;
                }
            }
        }

        Err(ShoalError::NotFound(format!("{} not in the cluster", hash)))
    }

    /// Probe peers in read order for a full-size copy; returns the first
    /// node claiming to hold it.
    pub async fn locate(&self, hash: &ImageHash, extension: Extension) -> Option<Node> {
        let myself_uuid = self.myself().await.uuid;

        for node in self.read_order(hash).await {
            if node.uuid == myself_uuid {
                continue;
            }
            match self.client.retrieve_info(&node, hash, extension).await {
                Ok(Some(info)) => {
                    self.mark_seen(&node.uuid).await;
                    if info.local {
                        return Some(node);
                    }
                }
                Ok(None) => {
                    self.mark_seen(&node.uuid).await;
                }
                Err(error) => {
                    tracing::debug!("probe of {} on {} failed: {}", hash, node.uuid, error);
                    self.mark_failed(&node.uuid).await;
                }
            }
        }

        None
    }
}

/// Deterministic placement: each candidate contributes REPLICAS virtual
/// points; the node owning the smallest point at or past the hash comes
/// first, then clockwise. Equal points order by uuid ascending.
fn ring_order(candidates: &[Node], hash: &ImageHash) -> Vec<Node> {
    let mut points: Vec<(String, String, usize)> = Vec::with_capacity(candidates.len() * REPLICAS);
    for (idx, node) in candidates.iter().enumerate() {
        for key in ring_keys(&node.uuid) {
            points.push((key, node.uuid.clone(), idx));
        }
    }
    if points.is_empty() {
        return Vec::new();
    }
    points.sort();

    let start = points.partition_point(|(key, _, _)| key.as_str() < hash.as_hex());
    let mut emitted = HashSet::new();
    let mut order = Vec::with_capacity(candidates.len());
    for offset in 0..points.len() {
        let idx = points[(start + offset) % points.len()].2;
        if emitted.insert(idx) {
            order.push(candidates[idx].clone());
            if order.len() == candidates.len() {
                break;
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_order_is_a_permutation() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        for uuid in ["uuid-a", "uuid-b", "uuid-c"] {
            cluster
                .add_neighbor(Node::new(uuid, uuid, "localhost:9999", "", true))
                .await;
        }

        let hash = ImageHash::of_bytes(b"some image bytes");
        let order = cluster.read_order(&hash).await;

        let mut uuids: Vec<String> = order.iter().map(|n| n.uuid.clone()).collect();
        uuids.sort();
        assert_eq!(uuids, vec!["uuid-a", "uuid-b", "uuid-c", "uuid-myself"]);
    }

    #[tokio::test]
    async fn read_order_is_deterministic() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        for uuid in ["uuid-a", "uuid-b", "uuid-c", "uuid-d"] {
            cluster
                .add_neighbor(Node::new(uuid, uuid, "localhost:9999", "", true))
                .await;
        }

        for payload in [&b"one"[..], b"two", b"three"] {
            let hash = ImageHash::of_bytes(payload);
            let first: Vec<String> = cluster
                .read_order(&hash)
                .await
                .iter()
                .map(|n| n.uuid.clone())
                .collect();
            let second: Vec<String> = cluster
                .read_order(&hash)
                .await
                .iter()
                .map(|n| n.uuid.clone())
                .collect();
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn write_order_keeps_only_writeable_in_read_order() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        cluster
            .add_neighbor(Node::new("a", "uuid-a", "localhost:9999", "", true))
            .await;
        cluster
            .add_neighbor(Node::new("b", "uuid-b", "localhost:9999", "", false))
            .await;
        cluster
            .add_neighbor(Node::new("c", "uuid-c", "localhost:9999", "", true))
            .await;

        let hash = ImageHash::of_bytes(b"placement");
        let read: Vec<String> = cluster
            .read_order(&hash)
            .await
            .iter()
            .map(|n| n.uuid.clone())
            .collect();
        let write: Vec<String> = cluster
            .write_order(&hash)
            .await
            .iter()
            .map(|n| n.uuid.clone())
            .collect();

        assert!(!write.contains(&"uuid-b".to_string()));
        let filtered: Vec<String> = read
            .iter()
            .filter(|uuid| uuid.as_str() != "uuid-b")
            .cloned()
            .collect();
        assert_eq!(write, filtered);
    }

    #[tokio::test]
    async fn lone_node_order_is_just_myself() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        let hash = ImageHash::of_bytes(b"alone");
        let order = cluster.read_order(&hash).await;
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].uuid, "uuid-myself");
    }

    #[tokio::test]
    async fn announce_adds_then_updates() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();

        cluster
            .apply_announce(AnnounceUpdate {
                uuid: "uuid-a".to_string(),
                nickname: Some("alpha".to_string()),
                base_url: Some("localhost:8001".to_string()),
                writeable: Some(true),
                ..Default::default()
            })
            .await;

        let added = cluster.find_neighbor_by_uuid("uuid-a").await.unwrap();
        assert_eq!(added.nickname, "alpha");
        assert!(added.writeable);
        assert!(added.is_current());

        cluster
            .apply_announce(AnnounceUpdate {
                uuid: "uuid-a".to_string(),
                nickname: Some("renamed".to_string()),
                writeable: Some(false),
                ..Default::default()
            })
            .await;

        let updated = cluster.find_neighbor_by_uuid("uuid-a").await.unwrap();
        assert_eq!(updated.nickname, "renamed");
        assert_eq!(updated.base_url, "localhost:8001");
        assert!(!updated.writeable);
        assert_eq!(cluster.neighbors().await.len(), 1);
    }

    #[tokio::test]
    async fn announce_never_adds_myself() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        cluster
            .apply_announce(AnnounceUpdate {
                uuid: "uuid-myself".to_string(),
                ..Default::default()
            })
            .await;
        assert!(cluster.neighbors().await.is_empty());
    }

    #[tokio::test]
    async fn merge_prefers_most_recently_seen() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();

        let mut stale = Node::new("a", "uuid-a", "localhost:8001", "", true);
        stale.last_seen = Utc::now();
        cluster.add_neighbor(stale.clone()).await;

        let mut outdated = stale.clone();
        outdated.nickname = "old-name".to_string();
        outdated.last_seen = stale.last_seen - chrono::Duration::minutes(5);

        let mut fresh = stale.clone();
        fresh.nickname = "new-name".to_string();
        fresh.last_seen = stale.last_seen + chrono::Duration::minutes(5);

        cluster.merge_neighbors(vec![outdated]).await;
        assert_eq!(
            cluster.find_neighbor_by_uuid("uuid-a").await.unwrap().nickname,
            "a"
        );

        cluster.merge_neighbors(vec![fresh]).await;
        assert_eq!(
            cluster.find_neighbor_by_uuid("uuid-a").await.unwrap().nickname,
            "new-name"
        );
    }

    #[tokio::test]
    async fn update_neighbor_rejects_unknown_uuid() {
        let myself = Node::new("me", "uuid-myself", "localhost:8000", "", true);
        let cluster = Cluster::new(myself).unwrap();
        let stranger = Node::new("x", "uuid-x", "localhost:9999", "", true);
        assert!(cluster.update_neighbor(stranger).await.is_err());
    }
}
