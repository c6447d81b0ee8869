//! Layer cache access.
//!
//! The cache accessor turns a layer descriptor into an immutable,
//! parent-linked ref backed by the snapshot subsystem. This crate only
//! consumes the contract: it builds chains strictly base-to-top, hands
//! ownership forward link by link, and annotates refs with advisory
//! metadata. Blob unpacking and snapshot bookkeeping live behind the
//! trait.

use crate::constants::LAYER_TYPE_WINDOWS;
use crate::content::Descriptor;
use crate::error::Result;
use crate::progress::ProgressController;
use crate::pull::ContentProvider;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A handle to materialized, content-addressable layer data.
///
/// `release` gives up this handle's hold on the cache record; it is the
/// cache-level operation, distinct from dropping the value. A handle
/// must not be used to obtain new holds after release. `parent` returns
/// a handle sharing the receiver's hold; it must not be separately
/// released.
#[async_trait]
pub trait ImmutableRef: Send + Sync {
    /// Stable identifier of this ref; doubles as the id of the lease
    /// that owns the ref's non-layer resources.
    fn id(&self) -> String;

    /// The parent ref, if this layer stacks on one.
    fn parent(&self) -> Option<Arc<dyn ImmutableRef>>;

    /// Releases this handle's hold. The underlying content may become
    /// eligible for garbage collection once no holds remain.
    async fn release(&self) -> Result<()>;

    /// Advisory tag describing how the ref was produced.
    fn record_type(&self) -> Option<String>;

    /// Sets the record-type tag.
    fn set_record_type(&self, record_type: &str) -> Result<()>;

    /// Layer-type marker (e.g. foreign-OS chains).
    fn layer_type(&self) -> Option<String>;

    /// Sets the layer-type marker.
    fn set_layer_type(&self, layer_type: &str) -> Result<()>;
}

/// Provides content-addressable layer refs from blob descriptors.
#[async_trait]
pub trait CacheAccessor: Send + Sync {
    /// Returns a ref for `desc` stacked on `parent`, fetching remote
    /// content through the descriptor's handler when needed.
    async fn get_by_blob(
        &self,
        desc: &Descriptor,
        parent: Option<Arc<dyn ImmutableRef>>,
        handlers: &DescHandlers,
    ) -> Result<Arc<dyn ImmutableRef>>;
}

/// Binds a content digest to its remote provider and progress
/// attribution.
///
/// One handler instance is shared across all layer descriptors of a
/// single pull, so fetch progress is attributed to one logical
/// operation.
pub struct DescHandler {
    /// Remote provider for descriptors not yet in local storage.
    pub provider: Arc<dyn ContentProvider>,
    /// Fully resolved image reference the descriptors came from.
    pub image_ref: String,
    /// Progress attribution for fetches through this handler.
    pub progress: ProgressController,
}

impl std::fmt::Debug for DescHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescHandler")
            .field("image_ref", &self.image_ref)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

/// Digest → handler associations carried alongside cache keys.
pub type DescHandlers = HashMap<String, Arc<DescHandler>>;

/// Tags a ref and all its ancestors with the Windows layer-type marker.
///
/// Mixed-tag chains are invalid, so the walk covers every ancestor. The
/// walk is iterative; layer chains can be long.
pub fn mark_layer_type_windows(top: &Arc<dyn ImmutableRef>) -> Result<()> {
    let mut node = Some(Arc::clone(top));
    while let Some(r) = node {
        r.set_layer_type(LAYER_TYPE_WINDOWS)?;
        node = r.parent();
    }
    Ok(())
}
