//! Shared test doubles for resolver tests.
//!
//! Each integration suite compiles this module separately and uses a
//! subset of it.
#![allow(dead_code)]

use async_trait::async_trait;
use ocisource::{
    digest_from_bytes, BlobStore, CacheAccessor, ContentProvider, ContentStore, DescHandlers,
    Descriptor, Error, ImmutableRef, LeaseGuard, ManifestPuller, MemoryLeaseManager,
    PulledManifests, Result, SessionGroup, OCI_IMAGE_CONFIG_MEDIA_TYPE,
    OCI_IMAGE_MANIFEST_MEDIA_TYPE, RESOLVE_LEASE_TTL,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Provider double for tests that never fetch remote content.
pub struct NullProvider;

#[async_trait]
impl ContentProvider for NullProvider {
    async fn fetch(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        Err(Error::ContentFetchFailed {
            digest: desc.digest.clone(),
            reason: "no remote content in tests".to_string(),
        })
    }
}

/// A fixed image a [`ScriptedPuller`] serves.
#[derive(Clone)]
pub struct FakeImage {
    pub manifest_bytes: Vec<u8>,
    pub config_bytes: Vec<u8>,
    pub layers: Vec<Descriptor>,
}

impl FakeImage {
    /// A single-layer image whose config declares the given diff IDs.
    pub fn layered(diff_ids: &[&str], layer_digests: &[&str]) -> Self {
        let config_bytes = format!(
            r#"{{"rootfs":{{"type":"layers","diff_ids":[{}]}}}}"#,
            diff_ids
                .iter()
                .map(|d| format!("\"{}\"", d))
                .collect::<Vec<_>>()
                .join(",")
        )
        .into_bytes();
        Self {
            manifest_bytes: format!(r#"{{"schemaVersion":2,"layers":{}}}"#, layer_digests.len())
                .into_bytes(),
            config_bytes,
            layers: layer_digests.iter().map(|d| layer_descriptor(d)).collect(),
        }
    }

    /// An image whose manifest lists no remote layer descriptors.
    pub fn empty() -> Self {
        Self {
            manifest_bytes: br#"{"schemaVersion":2,"layers":0}"#.to_vec(),
            config_bytes: b"{}".to_vec(),
            layers: Vec::new(),
        }
    }

    pub fn manifest_digest(&self) -> String {
        digest_from_bytes(&self.manifest_bytes)
    }

    pub fn config_digest(&self) -> String {
        digest_from_bytes(&self.config_bytes)
    }
}

pub fn layer_descriptor(digest: &str) -> Descriptor {
    Descriptor {
        digest: digest.to_string(),
        size: 1024,
        media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
    }
}

/// Manifest puller double: serves one fixed image, writes manifest and
/// config into the backing store on every pull (so eviction recovery can
/// be exercised), and counts pulls.
pub struct ScriptedPuller {
    pub image: FakeImage,
    pub store: Arc<BlobStore>,
    pub pulls: AtomicUsize,
}

impl ScriptedPuller {
    pub fn new(image: FakeImage, store: Arc<BlobStore>) -> Self {
        Self {
            image,
            store,
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestPuller for ScriptedPuller {
    async fn pull_manifests(
        &self,
        _session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<PulledManifests> {
        self.pulls.fetch_add(1, Ordering::SeqCst);

        let manifest_digest = self.image.manifest_digest();
        let config_digest = self.image.config_digest();

        self.store
            .put_blob(&manifest_digest, &self.image.manifest_bytes)
            .await?;
        self.store
            .put_blob(&config_digest, &self.image.config_bytes)
            .await?;
        if let Some(lease) = lease {
            lease.add_resource(&manifest_digest).await?;
            lease.add_resource(&config_digest).await?;
        }

        let main_manifest = Descriptor {
            digest: manifest_digest,
            size: self.image.manifest_bytes.len() as u64,
            media_type: OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
        };
        let config = Descriptor {
            digest: config_digest,
            size: self.image.config_bytes.len() as u64,
            media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
        };

        Ok(PulledManifests {
            resolved_ref: format!("docker.io/library/test@{}", main_manifest.digest),
            main_manifest: main_manifest.clone(),
            config: config.clone(),
            descriptors: self.image.layers.clone(),
            non_layers: vec![main_manifest, config],
            provider: Arc::new(NullProvider),
        })
    }

    async fn pull_config(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<(String, Vec<u8>)> {
        let manifests = self.pull_manifests(session, lease).await?;
        let bytes = self.store.read_blob(&manifests.config).await?;
        Ok((manifests.config.digest.clone(), bytes))
    }
}

/// Manifest puller double that always fails, counting attempts.
pub struct FailingPuller {
    pub pulls: AtomicUsize,
}

impl FailingPuller {
    pub fn new() -> Self {
        Self {
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestPuller for FailingPuller {
    async fn pull_manifests(
        &self,
        _session: &SessionGroup,
        _lease: Option<&LeaseGuard>,
    ) -> Result<PulledManifests> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Err(Error::ManifestPullFailed {
            reference: "docker.io/library/test:latest".to_string(),
            reason: "registry unreachable".to_string(),
        })
    }

    async fn pull_config(
        &self,
        session: &SessionGroup,
        lease: Option<&LeaseGuard>,
    ) -> Result<(String, Vec<u8>)> {
        self.pull_manifests(session, lease).await.map(|_| unreachable!())
    }
}

/// In-memory layer ref used by [`MemCacheAccessor`].
pub struct MemRef {
    id: String,
    pub digest: String,
    parent: Option<Arc<dyn ImmutableRef>>,
    pub releases: AtomicUsize,
    record_type: Mutex<Option<String>>,
    layer_type: Mutex<Option<String>>,
}

impl MemRef {
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn layer_type_value(&self) -> Option<String> {
        self.layer_type.lock().unwrap().clone()
    }

    pub fn record_type_value(&self) -> Option<String> {
        self.record_type.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImmutableRef for MemRef {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn parent(&self) -> Option<Arc<dyn ImmutableRef>> {
        self.parent.clone()
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn record_type(&self) -> Option<String> {
        self.record_type.lock().unwrap().clone()
    }

    fn set_record_type(&self, record_type: &str) -> Result<()> {
        *self.record_type.lock().unwrap() = Some(record_type.to_string());
        Ok(())
    }

    fn layer_type(&self) -> Option<String> {
        self.layer_type.lock().unwrap().clone()
    }

    fn set_layer_type(&self, layer_type: &str) -> Result<()> {
        *self.layer_type.lock().unwrap() = Some(layer_type.to_string());
        Ok(())
    }
}

/// Cache accessor double building [`MemRef`] chains.
///
/// Every created ref is retained for inspection. When wired to a lease
/// manager it creates the per-ref lease the committed chain registers
/// its non-layer resources against. Rejects a parent handle that was
/// already released, and can inject a failure at a given build index.
pub struct MemCacheAccessor {
    pub created: Mutex<Vec<Arc<MemRef>>>,
    pub fail_at: Option<usize>,
    pub preset_record_type: Option<String>,
    pub lease_manager: Option<Arc<MemoryLeaseManager>>,
    pub seen_handlers: Mutex<Vec<DescHandlers>>,
}

impl MemCacheAccessor {
    pub fn new(lease_manager: Option<Arc<MemoryLeaseManager>>) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            fail_at: None,
            preset_record_type: None,
            lease_manager,
            seen_handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn created_refs(&self) -> Vec<Arc<MemRef>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheAccessor for MemCacheAccessor {
    async fn get_by_blob(
        &self,
        desc: &Descriptor,
        parent: Option<Arc<dyn ImmutableRef>>,
        handlers: &DescHandlers,
    ) -> Result<Arc<dyn ImmutableRef>> {
        let mut created = self.created.lock().unwrap();

        if self.fail_at == Some(created.len()) {
            return Err(Error::Internal("injected cache failure".to_string()));
        }

        // A released handle must never be handed back in.
        if let Some(parent) = &parent {
            let parent_id = parent.id();
            if let Some(record) = created.iter().find(|r| r.id == parent_id) {
                if record.release_count() > 0 {
                    return Err(Error::Internal(format!(
                        "parent {} used after release",
                        parent_id
                    )));
                }
            }
        }

        self.seen_handlers.lock().unwrap().push(handlers.clone());

        let r = Arc::new(MemRef {
            id: format!("ref-{}", desc.digest),
            digest: desc.digest.clone(),
            parent,
            releases: AtomicUsize::new(0),
            record_type: Mutex::new(self.preset_record_type.clone()),
            layer_type: Mutex::new(None),
        });
        if let Some(manager) = &self.lease_manager {
            manager.create_with_id(&r.id, RESOLVE_LEASE_TTL);
        }
        created.push(Arc::clone(&r));
        Ok(r)
    }
}

/// Content store double whose reads can be forced to fail.
pub struct FlakyStore {
    pub inner: Arc<BlobStore>,
    pub fail_reads: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn info(&self, digest: &str) -> Result<ocisource::BlobInfo> {
        self.inner.info(digest).await
    }

    async fn read_blob(&self, desc: &Descriptor) -> Result<Vec<u8>> {
        if let Some(reason) = self.fail_reads.lock().unwrap().get(&desc.digest) {
            return Err(Error::StorageWriteFailed(reason.clone()));
        }
        self.inner.read_blob(desc).await
    }

    async fn put_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        self.inner.put_blob(digest, data).await
    }
}
