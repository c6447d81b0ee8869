//! # ocisource
//!
//! **Container image source resolution for a build cache.**
//!
//! This crate turns a container image reference into (a) a stable,
//! content-derived cache key and (b) a locally materialized, ref-counted
//! chain of content-addressable layers. It sits between a build
//! scheduler, which needs cache keys before deciding whether to run
//! work, and a content-addressable snapshot subsystem, which needs
//! concrete layer blobs to build a filesystem view.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          ImageSource                                │
//! │   resolve_image_config() ── FlightGroup ──► one shared pull         │
//! │   resolve(identifier)    ──────────────► Puller (per instance)      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                            Puller                                   │
//! │   cache_key(session, level)   one-time gate, temporary lease,       │
//! │       manifest key ── config key (chain identity of diff IDs)       │
//! │   snapshot(session)           base-to-top ref chain, ownership      │
//! │       handed forward link by link, eviction recovery                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   ManifestPuller │ ContentStore │ CacheAccessor │ LeaseManager      │
//! │   (registry)     │ (BlobStore)  │ (snapshots)   │ (GC leases)       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Two-Phase Cache Keys
//!
//! The manifest identity alone detects "this exact tag/digest was
//! already resolved". Two different manifests can still produce
//! byte-identical filesystems (re-tagged images), so level 1 keys by the
//! chain identity of the layer list declared in the image config,
//! collapsing those into one cache entry without losing correctness.
//!
//! # Consistency Guarantees
//!
//! - Same input ⇒ same key: derivation is deterministic, and each
//!   puller instance computes its keys at most once, replaying the
//!   outcome (errors included) to every later caller.
//! - No partial chains: layer refs are built strictly base-to-top, at
//!   most two handles held at a time, every ref released exactly once on
//!   failure paths.
//! - No premature collection: blobs touched during resolution are
//!   registered against a short-lived GC lease, and content evicted
//!   between key computation and materialization is restored by an
//!   automatic re-pull.
//!
//! # Example
//!
//! ```rust,ignore
//! use ocisource::{ImageSource, ImageSourceOpt, SessionGroup, SourceIdentifier};
//!
//! #[tokio::main]
//! async fn main() -> ocisource::Result<()> {
//!     let source = ImageSource::new(opt);
//!     let session = SessionGroup::default();
//!
//!     // Fast path: config for planning, deduplicated across callers.
//!     let (digest, config) = source
//!         .resolve_image_config("docker.io/library/alpine:3.18", None, "default", &session)
//!         .await?;
//!
//!     // Slow path: cache key, then materialization on a miss.
//!     let id = SourceIdentifier::parse("docker-image://docker.io/library/alpine:3.18")?;
//!     let puller = source.resolve(id, None)?;
//!     let (key, opts, done) = puller.cache_key(&session, 0).await?;
//!     let chain = puller.snapshot(&session).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cachekey;
pub mod constants;
pub mod content;
pub mod error;
pub mod flight;
pub mod identifier;
pub mod lease;
pub mod platform;
pub mod progress;
pub mod pull;
pub mod puller;
pub mod source;

// Re-exports
pub use cache::{CacheAccessor, DescHandler, DescHandlers, ImmutableRef};
pub use cachekey::{cache_key_from_config, chain_id, digest_from_bytes, main_manifest_key};
pub use constants::*;
pub use content::{BlobInfo, BlobStore, ContentStore, Descriptor, GcStats};
pub use error::{Error, Result};
pub use flight::FlightGroup;
pub use identifier::{ImageIdentifier, ResolveMode, SourceIdentifier};
pub use lease::{Lease, LeaseGuard, LeaseManager, MemoryLeaseManager};
pub use platform::{Arch, Os, Platform};
pub use progress::{LogProgress, ProgressController, ProgressSink, Vertex};
pub use pull::{
    ContentProvider, CredentialSource, ImageStore, ManifestPuller, PulledManifests,
    RegistryPolicy, RegistryPuller, SessionGroup,
};
pub use puller::{CacheOpts, Puller, PullerOpt};
pub use source::{ImageSource, ImageSourceOpt};
