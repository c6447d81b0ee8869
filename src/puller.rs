//! Per-resolution image puller.
//!
//! One [`Puller`] answers two questions over its lifetime: "what is my
//! cache key?" and "materialize me into a ref-counted layer chain". The
//! cache-key phase runs exactly once per instance under a temporary
//! lease; concurrent callers block until it completes and then replay
//! its outcome, errors included. The materialization phase walks the
//! layer descriptors base-to-top, handing ref ownership forward link by
//! link, and recovers automatically when retained metadata was evicted
//! between the two phases.

use crate::cache::{mark_layer_type_windows, CacheAccessor, DescHandler, DescHandlers, ImmutableRef};
use crate::cachekey::{cache_key_from_config, main_manifest_key};
use crate::constants::RESOLVE_LEASE_TTL;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::identifier::ImageIdentifier;
use crate::lease::{LeaseGuard, LeaseManager};
use crate::platform::{Os, Platform};
use crate::progress::{OneOff, ProgressController, ProgressSink, Vertex};
use crate::pull::{ManifestPuller, PulledManifests, SessionGroup};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Options attached to a cache key so a downstream cache hit can still
/// attribute fetch progress and provenance without materializing layers.
#[derive(Clone, Default, Debug)]
pub struct CacheOpts {
    /// Digest → descriptor-handler associations for this pull.
    pub desc_handlers: DescHandlers,
}

/// Everything the one-time resolution produces; read-only afterwards.
struct Resolved {
    manifest: PulledManifests,
    manifest_key: String,
    config_key: String,
    desc_handlers: DescHandlers,
    lease: LeaseGuard,
}

/// Construction parameters for a [`Puller`].
pub struct PullerOpt {
    /// The identifier this puller resolves.
    pub id: ImageIdentifier,
    /// Target platform (already defaulted to the host when unset).
    pub platform: Platform,
    /// Manifest-pull collaborator bound to the reference/platform.
    pub manifest_puller: Arc<dyn ManifestPuller>,
    /// Local content store.
    pub content_store: Arc<dyn ContentStore>,
    /// Layer cache accessor.
    pub cache_accessor: Arc<dyn CacheAccessor>,
    /// Garbage-collection lease manager.
    pub lease_manager: Arc<dyn LeaseManager>,
    /// Progress event sink.
    pub progress: Arc<dyn ProgressSink>,
    /// Build-graph vertex requesting the pull, when known.
    pub vertex: Option<Vertex>,
}

/// Per-resolution instance; input to exactly one identifier.
pub struct Puller {
    id: ImageIdentifier,
    platform: Platform,
    manifest_puller: Arc<dyn ManifestPuller>,
    content_store: Arc<dyn ContentStore>,
    cache_accessor: Arc<dyn CacheAccessor>,
    lease_manager: Arc<dyn LeaseManager>,
    progress: Arc<dyn ProgressSink>,
    vertex: Option<Vertex>,
    state: OnceCell<std::result::Result<Arc<Resolved>, Arc<Error>>>,
}

impl Puller {
    pub fn new(opt: PullerOpt) -> Self {
        Self {
            id: opt.id,
            platform: opt.platform,
            manifest_puller: opt.manifest_puller,
            content_store: opt.content_store,
            cache_accessor: opt.cache_accessor,
            lease_manager: opt.lease_manager,
            progress: opt.progress,
            vertex: opt.vertex,
            state: OnceCell::new(),
        }
    }

    /// The identifier this puller was built for.
    pub fn id(&self) -> &ImageIdentifier {
        &self.id
    }

    /// Computes (once) and returns the cache key for `index`.
    ///
    /// Index 0, or any index while the config key is empty, yields the
    /// manifest-derived key with `done = false`: the caller should ask
    /// again once a deeper level is available. Index ≥ 1 with a
    /// non-empty config key yields the config-derived key with
    /// `done = true`.
    pub async fn cache_key(
        &self,
        session: &SessionGroup,
        index: usize,
    ) -> Result<(String, CacheOpts, bool)> {
        let resolved = self.resolve_once(session).await?;

        let opts = CacheOpts {
            desc_handlers: resolved.desc_handlers.clone(),
        };

        if index == 0 || resolved.config_key.is_empty() {
            return Ok((resolved.manifest_key.clone(), opts, false));
        }
        Ok((resolved.config_key.clone(), opts, true))
    }

    /// Materializes the layer chain, returning the final ref.
    ///
    /// A manifest with zero remote layer descriptors yields `None`. Must
    /// be called after [`Puller::cache_key`] determined a cache miss;
    /// this ordering is a caller contract.
    pub async fn snapshot(&self, session: &SessionGroup) -> Result<Option<Arc<dyn ImmutableRef>>> {
        let resolved = match self.state.get() {
            Some(Ok(resolved)) => Arc::clone(resolved),
            Some(Err(e)) => return Err(Error::Shared(Arc::clone(e))),
            None => {
                return Err(Error::Internal(
                    "snapshot called before cache key computation".to_string(),
                ));
            }
        };

        if resolved.manifest.descriptors.is_empty() {
            // Empty image: nothing to materialize. The resolution lease
            // expires on its own.
            return Ok(None);
        }

        let result = self.materialize(session, &resolved).await;
        resolved.lease.release().await;
        result.map(Some)
    }

    async fn resolve_once(&self, session: &SessionGroup) -> Result<Arc<Resolved>> {
        let outcome = self
            .state
            .get_or_init(|| async {
                self.resolve_inner(session)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            })
            .await;
        match outcome {
            Ok(resolved) => Ok(Arc::clone(resolved)),
            Err(e) => Err(Error::Shared(Arc::clone(e))),
        }
    }

    /// The one-time resolution: lease, progress, manifests, handlers,
    /// both keys. The lease is released here only if resolution fails;
    /// materialization is otherwise its last consumer.
    async fn resolve_inner(&self, session: &SessionGroup) -> Result<Resolved> {
        let lease = LeaseGuard::acquire(&self.lease_manager, RESOLVE_LEASE_TTL).await?;

        let progress = OneOff::start(
            Arc::clone(&self.progress),
            format!("resolve {}", self.id.reference),
        );
        let result = self.resolve_manifests(session, &lease).await;
        progress.finish(result.as_ref().err());

        match result {
            Ok((manifest, manifest_key, config_key, desc_handlers)) => Ok(Resolved {
                manifest,
                manifest_key,
                config_key,
                desc_handlers,
                lease,
            }),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    async fn resolve_manifests(
        &self,
        session: &SessionGroup,
        lease: &LeaseGuard,
    ) -> Result<(PulledManifests, String, String, DescHandlers)> {
        let manifest = self
            .manifest_puller
            .pull_manifests(session, Some(lease))
            .await?;

        // One handler instance shared by every remote layer descriptor,
        // so fetch progress is attributed to one logical pull.
        let mut desc_handlers: DescHandlers = HashMap::new();
        if !manifest.descriptors.is_empty() {
            let handler = Arc::new(DescHandler {
                provider: Arc::clone(&manifest.provider),
                image_ref: manifest.resolved_ref.clone(),
                progress: ProgressController {
                    sink: Arc::clone(&self.progress),
                    vertex_digest: self.vertex.as_ref().map(|v| v.digest.clone()),
                    vertex_name: self.vertex.as_ref().map(|v| v.name.clone()),
                },
            });
            for desc in &manifest.descriptors {
                desc_handlers.insert(desc.digest.clone(), Arc::clone(&handler));
            }
        }

        let manifest_key = main_manifest_key(&manifest.main_manifest.digest, &self.platform)?;

        let config_bytes = self.content_store.read_blob(&manifest.config).await?;
        let config_key = cache_key_from_config(&config_bytes);

        Ok((manifest, manifest_key, config_key, desc_handlers))
    }

    async fn materialize(
        &self,
        session: &SessionGroup,
        resolved: &Resolved,
    ) -> Result<Arc<dyn ImmutableRef>> {
        let current = self.build_chain(resolved).await?;

        let mut recovery_leases = Vec::new();
        let committed = self
            .commit_chain(session, resolved, &current, &mut recovery_leases)
            .await;
        for lease in recovery_leases {
            lease.release().await;
        }

        if let Err(e) = committed {
            release_ref(current.as_ref()).await;
            return Err(e);
        }
        Ok(current)
    }

    /// Walks the layer descriptors base-to-top. At most one previous and
    /// one current ref are held; the previous is released as soon as the
    /// next is obtained. Chain ownership belongs to the final ref.
    async fn build_chain(&self, resolved: &Resolved) -> Result<Arc<dyn ImmutableRef>> {
        let mut current: Option<Arc<dyn ImmutableRef>> = None;
        for desc in &resolved.manifest.descriptors {
            let parent = current.take();
            let next = self
                .cache_accessor
                .get_by_blob(desc, parent.clone(), &resolved.desc_handlers)
                .await;
            if let Some(parent) = parent {
                release_ref(parent.as_ref()).await;
            }
            current = Some(next?);
        }
        current.ok_or_else(|| Error::Internal("layer chain build produced no ref".to_string()))
    }

    /// Makes the built chain durable: restores evicted non-layer content
    /// and registers it against the lease owning the final ref, tags
    /// foreign-OS chains, and records how the ref was produced.
    async fn commit_chain(
        &self,
        session: &SessionGroup,
        resolved: &Resolved,
        current: &Arc<dyn ImmutableRef>,
        recovery_leases: &mut Vec<LeaseGuard>,
    ) -> Result<()> {
        for desc in &resolved.manifest.non_layers {
            match self.content_store.info(&desc.digest).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    // Evicted since the cache-key phase; re-pull under a
                    // fresh temporary lease to restore it.
                    debug!(
                        "content {} evicted since cache-key phase, re-pulling",
                        desc.digest
                    );
                    let lease =
                        LeaseGuard::acquire(&self.lease_manager, RESOLVE_LEASE_TTL).await?;
                    let repulled = self
                        .manifest_puller
                        .pull_manifests(session, Some(&lease))
                        .await;
                    recovery_leases.push(lease);
                    repulled?;
                }
                Err(e) => return Err(e),
            }

            // The final ref's lease owns the non-layer content from here
            // on, independent of the short-lived resolution lease.
            self.lease_manager
                .add_resource(&current.id(), &desc.digest)
                .await?;
        }

        if self.platform.os == Os::Windows && !cfg!(target_os = "windows") {
            mark_layer_type_windows(current)?;
        }

        if let Some(record_type) = &self.id.record_type {
            if current.record_type().is_none() {
                current.set_record_type(record_type)?;
            }
        }

        Ok(())
    }
}

/// Best-effort ref release; a failure is logged and never masks the
/// error already being returned.
async fn release_ref(r: &dyn ImmutableRef) {
    if let Err(e) = r.release().await {
        warn!("failed to release ref {}: {}", r.id(), e);
    }
}
