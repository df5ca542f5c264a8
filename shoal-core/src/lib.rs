//! Shoal Core - Core library for the distributed image store
//!
//! A peer-to-peer, content-addressed image hosting system using:
//! - SHA-1 content addressing with a hash-derived directory layout
//! - A consistent-hash ring over peers for placement and replication
//! - Best-effort stash fan-out to a configurable replication target
//! - A bounded resize pool with single-flight per output file

pub mod blob_store;
pub mod cache;
pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod node;
pub mod resize;
pub mod size;
pub mod specifier;

pub use blob_store::BlobStore;
pub use cache::{MemoryCache, RenditionCache};
pub use cluster::{AnnounceResponse, AnnounceUpdate, Cluster};
pub use coordinator::{Coordinator, ServedImage, UploadReport};
pub use error::{Result, ShoalError};
pub use hash::{ring_keys, ImageHash, REPLICAS};
pub use node::{ImageInfo, Node, PeerClient};
pub use resize::{Codec, CodecOutput, MagickCodec, ResizePool, ResizeRequest, ResizeResponse};
pub use size::SizeSpec;
pub use specifier::{Extension, ImageSpecifier};
