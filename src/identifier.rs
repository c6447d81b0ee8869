//! Source identifiers and resolve modes.
//!
//! An [`ImageIdentifier`] names exactly one image to resolve: reference,
//! optional target platform, resolve mode, and an optional record-type
//! tag the cache uses to note how the resulting ref was produced.
//! Identifiers are immutable once constructed.

use crate::constants::{DOCKER_IMAGE_SCHEME, IMAGE_REF_VALID_CHARS, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};
use crate::platform::Platform;

/// How a reference should be resolved against registry and local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    /// Registry resolution, reusing local metadata where the reference
    /// pins a digest.
    #[default]
    Default,
    /// Always consult the registry, even for digest references.
    ForcePull,
    /// Prefer locally stored image metadata over the registry.
    PreferLocal,
}

impl ResolveMode {
    /// Parses a resolve-mode string. The empty string means [`ResolveMode::Default`].
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(ResolveMode::Default),
            "pull" => Ok(ResolveMode::ForcePull),
            "local" => Ok(ResolveMode::PreferLocal),
            other => Err(Error::InvalidResolveMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ResolveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolveMode::Default => "default",
            ResolveMode::ForcePull => "pull",
            ResolveMode::PreferLocal => "local",
        };
        write!(f, "{}", s)
    }
}

/// Identifies one image to resolve. Input to exactly one puller instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageIdentifier {
    /// Image reference (e.g. `docker.io/library/alpine:3.18`).
    pub reference: String,
    /// Target platform; defaults to the host when unset.
    pub platform: Option<Platform>,
    /// Resolve mode.
    pub resolve_mode: ResolveMode,
    /// Advisory tag recorded on the final ref, noting how it was produced.
    pub record_type: Option<String>,
}

impl ImageIdentifier {
    /// Creates an identifier after validating the reference.
    pub fn new(reference: &str) -> Result<Self> {
        validate_reference(reference)?;
        Ok(Self {
            reference: reference.to_string(),
            platform: None,
            resolve_mode: ResolveMode::Default,
            record_type: None,
        })
    }
}

/// Validates an image reference against length and character bounds.
fn validate_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "empty image reference".to_string(),
        });
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::InvalidImageReference {
            reference: reference.chars().take(50).collect::<String>() + "...",
            reason: format!("exceeds maximum length of {} bytes", MAX_IMAGE_REF_LEN),
        });
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err(Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: "contains invalid characters".to_string(),
        });
    }
    Ok(())
}

/// An identifier handed to the source coordinator by a build frontend.
///
/// Only image identifiers can be resolved by this crate; other schemes
/// fail at parse time with an invalid-identifier error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SourceIdentifier {
    /// An image reference to resolve.
    Image(ImageIdentifier),
}

impl SourceIdentifier {
    /// Parses a scheme-prefixed identifier such as
    /// `docker-image://docker.io/library/alpine:3.18`.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| Error::InvalidIdentifier(format!("missing scheme in '{}'", s)))?;
        if scheme != DOCKER_IMAGE_SCHEME {
            return Err(Error::InvalidIdentifier(format!(
                "unsupported scheme '{}'",
                scheme
            )));
        }
        Ok(SourceIdentifier::Image(ImageIdentifier::new(rest)?))
    }
}
