//! Manifest pulling.
//!
//! [`ManifestPuller`] is the contract the resolver core consumes: pull
//! the manifest chain for one reference/platform and report what must be
//! retained. [`RegistryPuller`] is the registry-backed implementation:
//! it resolves multi-arch indexes to the platform manifest, fetches
//! manifest and config with size and time bounds, stores both in the
//! local content store (verified against their digests), and registers
//! every written blob against the caller's lease.

use crate::constants::{
    ACCEPTED_MANIFEST_MEDIA_TYPES, DOCKER_MANIFEST_LIST_MEDIA_TYPE, MAX_CONFIG_SIZE,
    MAX_MANIFEST_SIZE, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE, PULL_TIMEOUT,
};
use crate::content::{ContentStore, Descriptor};
use crate::error::{Error, Result};
use crate::identifier::ResolveMode;
use crate::lease::LeaseGuard;
use crate::platform::Platform;
use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Supplies registry credentials for pull operations.
pub trait CredentialSource: Send + Sync {
    /// Credentials for a registry host.
    fn credentials(&self, registry: &str) -> RegistryAuth;
}

/// Per-request credential scope. The default is anonymous access.
#[derive(Clone, Default)]
pub struct SessionGroup {
    credentials: Option<Arc<dyn CredentialSource>>,
}

impl SessionGroup {
    /// A session drawing credentials from the given source.
    pub fn new(credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    /// Auth for one registry host.
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        match &self.credentials {
            Some(source) => source.credentials(registry),
            None => RegistryAuth::Anonymous,
        }
    }
}

/// Fetches remote blob content on demand during materialization.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Fetches the blob named by `desc`.
    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>>;
}

/// Local image metadata store, consulted by prefer-local resolution.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Looks up the manifest descriptor recorded for a reference.
    async fn get(&self, reference: &str) -> Result<Option<Descriptor>>;
}

/// Result of a manifest pull.
pub struct PulledManifests {
    /// Reference with the resolved manifest digest pinned.
    pub resolved_ref: String,
    /// Main (platform) manifest descriptor.
    pub main_manifest: Descriptor,
    /// Config descriptor.
    pub config: Descriptor,
    /// Remote layer descriptors in producer order: index 0 is the base.
    pub descriptors: Vec<Descriptor>,
    /// Non-filesystem content (index, manifest, config) that must
    /// survive until the chain is committed.
    pub non_layers: Vec<Descriptor>,
    /// Provider for any remote descriptor not yet in local storage.
    pub provider: Arc<dyn ContentProvider>,
}

/// Pulls manifests and config for one bound reference/platform.
#[async_trait]
pub trait ManifestPuller: Send + Sync {
    /// Pulls and locally stores the manifest chain. Every blob written
    /// is registered against `lease` when one is given.
    async fn pull_manifests(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<PulledManifests>;

    /// Config-only variant: resolves the manifest chain and returns the
    /// config digest and raw bytes.
    async fn pull_config(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<(String, Vec<u8>)>;
}

/// Per-registry transport policy.
#[derive(Debug, Clone, Default)]
pub struct RegistryPolicy {
    /// Registries contacted over plain HTTP (e.g. localhost test
    /// registries).
    pub insecure_registries: Vec<String>,
}

impl RegistryPolicy {
    fn client_for(&self, registry: &str) -> Client {
        let protocol = if self.insecure_registries.iter().any(|r| r == registry) {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        Client::new(ClientConfig {
            protocol,
            ..Default::default()
        })
    }
}

/// Registry-backed [`ManifestPuller`].
pub struct RegistryPuller {
    reference: Reference,
    src: String,
    platform: Platform,
    resolve_mode: ResolveMode,
    policy: RegistryPolicy,
    content_store: Arc<dyn ContentStore>,
    image_store: Option<Arc<dyn ImageStore>>,
}

impl RegistryPuller {
    /// Binds a puller to one reference, platform, and resolve mode.
    pub fn new(
        reference: &str,
        platform: Platform,
        resolve_mode: ResolveMode,
        policy: RegistryPolicy,
        content_store: Arc<dyn ContentStore>,
        image_store: Option<Arc<dyn ImageStore>>,
    ) -> Result<Self> {
        let parsed: Reference = reference
            .parse()
            .map_err(|e| Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: format!("{}", e),
            })?;
        Ok(Self {
            reference: parsed,
            src: reference.to_string(),
            platform,
            resolve_mode,
            policy,
            content_store,
            image_store,
        })
    }

    fn pull_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::ManifestPullFailed {
            reference: self.src.clone(),
            reason: reason.to_string(),
        }
    }

    async fn fetch_manifest_raw(
        &self,
        client: &Client,
        reference: &Reference,
        auth: &RegistryAuth,
    ) -> Result<(Vec<u8>, String)> {
        let (bytes, digest) = timeout(
            PULL_TIMEOUT,
            client.pull_manifest_raw(reference, auth, ACCEPTED_MANIFEST_MEDIA_TYPES),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", self.src),
            duration: PULL_TIMEOUT,
        })?
        .map_err(|e| self.pull_error(e))?;

        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(self.pull_error(format!(
                "manifest exceeds {} bytes: {}",
                MAX_MANIFEST_SIZE,
                bytes.len()
            )));
        }
        Ok((bytes, digest))
    }

    /// Manifest bytes recorded locally for this reference, when the
    /// image store and content store both still have them.
    async fn local_manifest(&self) -> Option<(Vec<u8>, String)> {
        let store = self.image_store.as_ref()?;
        let desc = match store.get(&self.src).await {
            Ok(Some(desc)) => desc,
            Ok(None) => return None,
            Err(e) => {
                debug!("image store lookup for {} failed: {}", self.src, e);
                return None;
            }
        };
        match self.content_store.read_blob(&desc).await {
            Ok(bytes) => Some((bytes, desc.digest)),
            Err(_) => None,
        }
    }

    fn select_platform_entry<'a>(&self, index: &'a OciImageIndex) -> Result<&'a ImageIndexEntry> {
        let target_os = self.platform.os_str();
        let target_arch = self.platform.arch_str();

        let matching = index.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == target_os && p.architecture == target_arch)
        });

        matching.ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            self.pull_error(format!(
                "no manifest for {}/{}. Available: {}",
                target_os,
                target_arch,
                available.join(", ")
            ))
        })
    }

    async fn store_blob(
        &self,
        digest: &str,
        data: &[u8],
        lease: Option<&LeaseGuard>,
    ) -> Result<()> {
        self.content_store.put_blob(digest, data).await?;
        if let Some(lease) = lease {
            lease.add_resource(digest).await?;
        }
        Ok(())
    }
}

fn to_descriptor(d: &OciDescriptor) -> Descriptor {
    Descriptor {
        digest: d.digest.clone(),
        size: d.size as u64,
        media_type: d.media_type.clone(),
    }
}

fn looks_like_index(doc: &serde_json::Value) -> bool {
    let media_type = doc.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
    media_type == OCI_IMAGE_INDEX_MEDIA_TYPE
        || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
        || doc.get("manifests").is_some()
}

#[async_trait]
impl ManifestPuller for RegistryPuller {
    async fn pull_manifests(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<PulledManifests> {
        let registry = self.reference.registry().to_string();
        let auth = session.auth_for(&registry);
        let client = self.policy.client_for(&registry);

        info!("pulling manifests for {} ({})", self.src, self.platform);

        let mut fetched = None;
        if self.resolve_mode == ResolveMode::PreferLocal {
            fetched = self.local_manifest().await;
            if fetched.is_some() {
                debug!("reusing local manifest for {}", self.src);
            }
        }
        let (mut bytes, mut digest) = match fetched {
            Some(found) => found,
            None => {
                self.fetch_manifest_raw(&client, &self.reference, &auth)
                    .await?
            }
        };

        let mut non_layers = Vec::new();

        let doc: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| self.pull_error(e))?;
        if looks_like_index(&doc) {
            // Multi-arch index: retain it, then descend to the platform
            // manifest.
            self.store_blob(&digest, &bytes, lease).await?;
            non_layers.push(Descriptor {
                digest: digest.clone(),
                size: bytes.len() as u64,
                media_type: doc
                    .get("mediaType")
                    .and_then(|v| v.as_str())
                    .unwrap_or(OCI_IMAGE_INDEX_MEDIA_TYPE)
                    .to_string(),
            });

            let index: OciImageIndex =
                serde_json::from_slice(&bytes).map_err(|e| self.pull_error(e))?;
            let entry = self.select_platform_entry(&index)?;

            let digest_ref = format!(
                "{}/{}@{}",
                self.reference.registry(),
                self.reference.repository(),
                entry.digest
            );
            let platform_ref: Reference = digest_ref
                .parse()
                .map_err(|e| self.pull_error(format!("failed to build digest reference: {}", e)))?;

            let (platform_bytes, platform_digest) = self
                .fetch_manifest_raw(&client, &platform_ref, &auth)
                .await?;
            bytes = platform_bytes;
            digest = platform_digest;

            let nested: serde_json::Value =
                serde_json::from_slice(&bytes).map_err(|e| self.pull_error(e))?;
            if looks_like_index(&nested) {
                return Err(self.pull_error("nested image index not supported"));
            }
        }

        let manifest: OciImageManifest =
            serde_json::from_slice(&bytes).map_err(|e| self.pull_error(e))?;
        self.store_blob(&digest, &bytes, lease).await?;

        let main_manifest = Descriptor {
            digest: digest.clone(),
            size: bytes.len() as u64,
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
        };
        non_layers.push(main_manifest.clone());

        // Config blob.
        let config = to_descriptor(&manifest.config);
        if config.size > MAX_CONFIG_SIZE as u64 {
            return Err(self.pull_error(format!(
                "config exceeds {} bytes: {}",
                MAX_CONFIG_SIZE, config.size
            )));
        }
        let mut config_bytes = Vec::new();
        timeout(
            PULL_TIMEOUT,
            client.pull_blob(&self.reference, &manifest.config, &mut config_bytes),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull config {}", config.digest),
            duration: PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ContentFetchFailed {
            digest: config.digest.clone(),
            reason: e.to_string(),
        })?;
        self.store_blob(&config.digest, &config_bytes, lease).await?;
        non_layers.push(config.clone());

        let descriptors: Vec<Descriptor> = manifest.layers.iter().map(to_descriptor).collect();

        let resolved_ref = format!(
            "{}/{}@{}",
            self.reference.registry(),
            self.reference.repository(),
            digest
        );

        debug!(
            "resolved {} to {} ({} layers)",
            self.src,
            resolved_ref,
            descriptors.len()
        );

        let provider = Arc::new(RemoteProvider {
            client,
            reference: self.reference.clone(),
            auth,
        });

        Ok(PulledManifests {
            resolved_ref,
            main_manifest,
            config,
            descriptors,
            non_layers,
            provider,
        })
    }

    async fn pull_config(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<(String, Vec<u8>)> {
        let manifests = self.pull_manifests(session, lease).await?;
        let bytes = self.content_store.read_blob(&manifests.config).await?;
        Ok((manifests.config.digest.clone(), bytes))
    }
}

/// Remote blob access for descriptors that were not pulled eagerly.
struct RemoteProvider {
    client: Client,
    reference: Reference,
    auth: RegistryAuth,
}

#[async_trait]
impl ContentProvider for RemoteProvider {
    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        // Re-authenticate each fetch; the bearer token negotiated during
        // the manifest pull may have expired by materialization time.
        self.client
            .auth(&self.reference, &self.auth, RegistryOperation::Pull)
            .await
            .map_err(|e| Error::ContentFetchFailed {
                digest: desc.digest.clone(),
                reason: e.to_string(),
            })?;

        let oci_desc = OciDescriptor {
            digest: desc.digest.clone(),
            size: desc.size as i64,
            media_type: desc.media_type.clone(),
            urls: None,
            annotations: None,
        };

        let mut data = Vec::new();
        timeout(
            PULL_TIMEOUT,
            self.client.pull_blob(&self.reference, &oci_desc, &mut data),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("fetch blob {}", desc.digest),
            duration: PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ContentFetchFailed {
            digest: desc.digest.clone(),
            reason: e.to_string(),
        })?;

        debug!("fetched blob {} ({} bytes)", desc.digest, data.len());
        Ok(data)
    }
}
