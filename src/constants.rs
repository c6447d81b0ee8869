//! # Resolution Constants
//!
//! Defines all resource limits, timeouts, and media types for image
//! source resolution. These constants are the **single source of truth**
//! for bounds throughout the crate.
//!
//! ## Cross-References
//!
//! - [`crate::identifier`]: Uses reference validation limits
//! - [`crate::pull`]: Uses size limits and timeouts for manifest pulling
//! - [`crate::puller`]: Uses the resolution lease TTL
//! - [`crate::content`]: Uses digest validation patterns

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================
//
// These limits prevent memory exhaustion from malicious or malformed
// registry responses. Layer blobs are not bounded here: layer content is
// fetched lazily by the cache accessor, not during resolution.
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// Prevents overly long image names from reaching parsers or filesystem
/// paths. Registry implementations may have lower limits.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum manifest size (1 MiB).
///
/// Prevents memory exhaustion from parsing malformed manifests.
/// Standard OCI manifests are typically under 100 KiB.
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
///
/// Prevents memory exhaustion from oversized image configs.
/// Standard configs are typically under 50 KiB.
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

// =============================================================================
// Timeouts & Leases
// =============================================================================

/// Timeout for a single manifest or config fetch (5 minutes).
///
/// Prevents indefinite hangs from unresponsive registries or network
/// partitions. Layer downloads performed later by the cache accessor
/// carry their own bounds.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Expiration of the temporary lease guarding a resolution (5 minutes).
///
/// The lease protects blobs touched between cache-key computation and
/// chain materialization; it covers the resolution window only, never
/// the cache lifetime of the resulting chain.
pub const RESOLVE_LEASE_TTL: Duration = Duration::from_secs(300);

// =============================================================================
// Identifier Schemes
// =============================================================================

/// Scheme prefix for image identifiers handed down by a build frontend.
pub const DOCKER_IMAGE_SCHEME: &str = "docker-image";

// =============================================================================
// OCI Media Types
// =============================================================================
//
// Standard IANA media types for OCI artifacts, used for content
// negotiation with registries and for classifying pulled descriptors.
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI Image Manifest media type (single-platform image).
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type (multi-platform manifest list).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type (image configuration blob).
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Docker schema 2 manifest media type.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker schema 2 manifest list media type.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Media types acceptable when fetching a manifest by reference.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

// =============================================================================
// Layer Metadata
// =============================================================================

/// Layer-type marker applied to every ref of a chain pulled for a
/// Windows target on a non-Windows host.
pub const LAYER_TYPE_WINDOWS: &str = "windows";

/// Root filesystem type declared by layered OCI image configs.
pub const ROOTFS_TYPE_LAYERS: &str = "layers";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for OCI image references.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`, `/`, `:`, `@`
///
/// The `@` is for digest references like `nginx@sha256:abc...`.
/// The `:` is for tag references like `nginx:latest`.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";
