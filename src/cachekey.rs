//! Cache key derivation.
//!
//! Two keys identify a resolved image. The manifest key digests the
//! resolved manifest identity together with the target platform; it is
//! available as soon as the manifest is known. The config key is derived
//! from the image config blob: for a recognized layered image it is the
//! chain identity of the declared layer list, which collapses re-tagged
//! but byte-identical filesystems into one cache entry.

use crate::constants::ROOTFS_TYPE_LAYERS;
use crate::error::{Error, Result};
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw content digest of a byte slice, `sha256:<hex>`.
pub fn digest_from_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Chain identity over an ordered list of per-layer content identities.
///
/// `chain(L0) = L0`; `chain(L0..Ln) = digest(chain(L0..Ln-1) + " " + Ln)`.
/// Order is semantically meaningful: it is the filesystem stacking order.
pub fn chain_id(diff_ids: &[String]) -> String {
    let mut iter = diff_ids.iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let mut chain = first.clone();
    for id in iter {
        chain = digest_from_bytes(format!("{} {}", chain, id).as_bytes());
    }
    chain
}

// Tolerant view of an image config document. Only the rootfs section
// matters for keying; absent fields default so that `{}` parses like an
// empty config rather than failing into the raw-digest fallback.
#[derive(Debug, Default, Deserialize)]
struct ImageConfigDoc {
    #[serde(default)]
    rootfs: RootFsDoc,
}

#[derive(Debug, Default, Deserialize)]
struct RootFsDoc {
    #[serde(rename = "type", default)]
    fs_type: String,
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Derives a stable cache key from raw image-config bytes.
///
/// Parse failure falls back to the raw content digest of the bytes
/// (still deterministic). A parsed config that is not a layered image,
/// or declares no layer identities, yields the empty string: the key is
/// not determinable from the config alone and callers must stay on
/// manifest-level keying.
pub fn cache_key_from_config(data: &[u8]) -> String {
    let config: ImageConfigDoc = match serde_json::from_slice(data) {
        Ok(config) => config,
        Err(_) => return digest_from_bytes(data),
    };
    if config.rootfs.fs_type != ROOTFS_TYPE_LAYERS || config.rootfs.diff_ids.is_empty() {
        return String::new();
    }
    chain_id(&config.rootfs.diff_ids)
}

#[derive(Serialize)]
struct ManifestKeyInput<'a> {
    digest: &'a str,
    os: &'a str,
    arch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    variant: Option<&'a str>,
}

/// Digest over {main manifest digest, OS, architecture, variant}.
pub fn main_manifest_key(manifest_digest: &str, platform: &Platform) -> Result<String> {
    let input = ManifestKeyInput {
        digest: manifest_digest,
        os: platform.os_str(),
        arch: platform.arch_str(),
        variant: platform.variant.as_deref(),
    };
    let dt = serde_json::to_vec(&input).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(digest_from_bytes(&dt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn chain_id_of_single_layer_is_that_layer() {
        let d = ids(&["sha256:aaaa"]);
        assert_eq!(chain_id(&d), "sha256:aaaa");
    }

    #[test]
    fn chain_id_is_order_sensitive() {
        let forward = chain_id(&ids(&["sha256:aaaa", "sha256:bbbb"]));
        let reversed = chain_id(&ids(&["sha256:bbbb", "sha256:aaaa"]));
        assert_ne!(forward, reversed);
    }

    #[test]
    fn chain_id_is_deterministic() {
        let d = ids(&["sha256:aaaa", "sha256:bbbb", "sha256:cccc"]);
        assert_eq!(chain_id(&d), chain_id(&d));
    }

    #[test]
    fn layered_config_keys_by_chain_identity() {
        let config = br#"{"rootfs":{"type":"layers","diff_ids":["sha256:d1","sha256:d2"]}}"#;
        let expected = chain_id(&ids(&["sha256:d1", "sha256:d2"]));
        assert_eq!(cache_key_from_config(config), expected);
    }

    #[test]
    fn empty_object_config_yields_empty_key() {
        assert_eq!(cache_key_from_config(b"{}"), "");
    }

    #[test]
    fn non_layered_rootfs_yields_empty_key() {
        let config = br#"{"rootfs":{"type":"custom","diff_ids":["sha256:d1"]}}"#;
        assert_eq!(cache_key_from_config(config), "");
    }

    #[test]
    fn zero_diff_ids_yields_empty_key() {
        let config = br#"{"rootfs":{"type":"layers","diff_ids":[]}}"#;
        assert_eq!(cache_key_from_config(config), "");
    }

    #[test]
    fn unparseable_config_falls_back_to_raw_digest() {
        let data = b"not json at all";
        assert_eq!(cache_key_from_config(data), digest_from_bytes(data));
    }

    #[test]
    fn manifest_key_depends_on_platform() {
        let linux = Platform::parse("linux/amd64").unwrap();
        let arm = Platform::parse("linux/arm64").unwrap();
        let k1 = main_manifest_key("sha256:m", &linux).unwrap();
        let k2 = main_manifest_key("sha256:m", &arm).unwrap();
        assert_ne!(k1, k2);
        assert_eq!(k1, main_manifest_key("sha256:m", &linux).unwrap());
    }
}
