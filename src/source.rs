//! Image source coordinator.
//!
//! The entry point the build scheduler talks to. The fast path resolves
//! an image config (digest + bytes) for planning, deduplicated across
//! concurrent callers; the slow path hands out a fresh [`Puller`] per
//! resolve-instance request, without any network activity of its own.

use crate::cache::CacheAccessor;
use crate::constants::{DOCKER_IMAGE_SCHEME, RESOLVE_LEASE_TTL};
use crate::content::ContentStore;
use crate::error::Result;
use crate::flight::FlightGroup;
use crate::identifier::{ResolveMode, SourceIdentifier};
use crate::lease::{LeaseGuard, LeaseManager};
use crate::platform::Platform;
use crate::progress::{ProgressSink, Vertex};
use crate::pull::{ImageStore, ManifestPuller, RegistryPolicy, RegistryPuller, SessionGroup};
use crate::puller::{Puller, PullerOpt};
use std::sync::Arc;

/// Collaborator handles supplied once at system construction.
pub struct ImageSourceOpt {
    /// Local content-addressable store.
    pub content_store: Arc<dyn ContentStore>,
    /// Layer cache accessor.
    pub cache_accessor: Arc<dyn CacheAccessor>,
    /// Garbage-collection lease manager.
    pub lease_manager: Arc<dyn LeaseManager>,
    /// Optional local image metadata store (prefer-local resolution).
    pub image_store: Option<Arc<dyn ImageStore>>,
    /// Registry-host transport policy.
    pub registry: RegistryPolicy,
    /// Progress event sink.
    pub progress: Arc<dyn ProgressSink>,
}

/// Resolves image references into cache keys and layer chains.
pub struct ImageSource {
    opt: ImageSourceOpt,
    config_flights: FlightGroup<(String, Vec<u8>)>,
}

impl ImageSource {
    pub fn new(opt: ImageSourceOpt) -> Self {
        Self {
            opt,
            config_flights: FlightGroup::new(),
        }
    }

    /// Identifier scheme this source serves.
    pub fn id(&self) -> &'static str {
        DOCKER_IMAGE_SCHEME
    }

    /// Resolves an image config to (digest, raw bytes) for planning.
    ///
    /// Concurrent calls with the same reference/platform share one
    /// underlying pull; every waiter observes the same result or the
    /// same error. Fails fast on an unrecognized resolve-mode string.
    pub async fn resolve_image_config(
        &self,
        reference: &str,
        platform: Option<&Platform>,
        resolve_mode: &str,
        session: &SessionGroup,
    ) -> Result<(String, Vec<u8>)> {
        let mode = ResolveMode::parse(resolve_mode)?;

        let mut key = reference.to_string();
        if let Some(platform) = platform {
            key += &platform.oci_platform();
        }

        self.config_flights
            .run(&key, || async move {
                let platform = platform.cloned().unwrap_or_else(Platform::detect);
                let puller = RegistryPuller::new(
                    reference,
                    platform,
                    mode,
                    self.opt.registry.clone(),
                    Arc::clone(&self.opt.content_store),
                    self.opt.image_store.clone(),
                )?;

                // The config blob is lease-protected for the resolution
                // window only; planning does not pin content.
                let lease = LeaseGuard::acquire(&self.opt.lease_manager, RESOLVE_LEASE_TTL).await?;
                let result = puller.pull_config(session, Some(&lease)).await;
                lease.release().await;
                result
            })
            .await
    }

    /// Builds a fresh per-resolution [`Puller`] for an image identifier.
    ///
    /// The platform defaults to the host when the identifier leaves it
    /// unset. No network activity occurs until the puller's cache-key
    /// phase runs.
    pub fn resolve(&self, id: SourceIdentifier, vertex: Option<Vertex>) -> Result<Puller> {
        let SourceIdentifier::Image(image_id) = id;

        let platform = image_id
            .platform
            .clone()
            .unwrap_or_else(Platform::detect);

        let manifest_puller = RegistryPuller::new(
            &image_id.reference,
            platform.clone(),
            image_id.resolve_mode,
            self.opt.registry.clone(),
            Arc::clone(&self.opt.content_store),
            self.opt.image_store.clone(),
        )?;

        Ok(Puller::new(PullerOpt {
            id: image_id,
            platform,
            manifest_puller: Arc::new(manifest_puller),
            content_store: Arc::clone(&self.opt.content_store),
            cache_accessor: Arc::clone(&self.opt.cache_accessor),
            lease_manager: Arc::clone(&self.opt.lease_manager),
            progress: Arc::clone(&self.opt.progress),
            vertex,
        }))
    }
}
