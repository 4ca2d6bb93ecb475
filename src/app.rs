use std::sync::{Mutex, PoisonError};

use crate::domain::{FormId, FormListing, RemoteFormDescriptor, UploadOutcome};
use crate::error::SyncError;
use crate::http::OpenRosaTransport;
use crate::reconcile::{FormsRegistry, ReconcileStats, reconcile};
use crate::stage::{StageOutcome, stage_forms};
use crate::store::FormsStore;
use crate::task::{CancelFlag, ProgressEvent, ProgressSink};
use crate::upload::{InstanceStore, UriRemapCache};
use crate::{catalog, upload};

/// Composition root for the four sync operations. The transport, registry,
/// and instance store are injected so every operation is testable in
/// isolation; per-operation locks keep at most one stage-or-reconcile run
/// and one upload run in flight for this app scope.
pub struct App<T, R, S> {
    transport: T,
    store: FormsStore,
    registry: Mutex<R>,
    instances: Mutex<S>,
    remap: Mutex<UriRemapCache>,
    // Stage-and-swap and reconcile both write the live tree; they share one
    // lock so they never overlap.
    tree_lock: Mutex<()>,
    upload_lock: Mutex<()>,
}

impl<T, R, S> App<T, R, S>
where
    T: OpenRosaTransport,
    R: FormsRegistry,
    S: InstanceStore,
{
    pub fn new(transport: T, store: FormsStore, registry: R, instances: S) -> Self {
        Self {
            transport,
            store,
            registry: Mutex::new(registry),
            instances: Mutex::new(instances),
            remap: Mutex::new(UriRemapCache::new()),
            tree_lock: Mutex::new(()),
            upload_lock: Mutex::new(()),
        }
    }

    /// Catalog Fetcher: query the listing endpoint. Leaf operation with no
    /// filesystem side effects.
    pub fn fetch_catalog(&self, listing_url: &str, sink: &dyn ProgressSink) -> FormListing {
        sink.event(ProgressEvent::message(format!(
            "fetching form listing from {listing_url}"
        )));
        catalog::fetch_form_listing(&self.transport, listing_url)
    }

    /// Stage-and-Swap Manager: download and atomically install forms.
    pub fn sync_forms(
        &self,
        forms: &[RemoteFormDescriptor],
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<StageOutcome, SyncError> {
        let _guard = self
            .tree_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stage_forms(&self.transport, &self.store, forms, sink, cancel)
    }

    /// Local Registry Reconciler: bring the persisted registry in line with
    /// the live forms tree.
    pub fn reconcile(
        &self,
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<ReconcileStats, SyncError> {
        let _guard = self
            .tree_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        reconcile(&self.store, &mut *registry, sink, cancel)
    }

    pub fn pending_records(&self, form_id: &FormId) -> Result<Vec<String>, SyncError> {
        let instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        instances.pending_records(form_id)
    }

    /// Instance Upload Pipeline: push completed records to the server in
    /// bounded-size multipart batches.
    pub fn upload_instances(
        &self,
        form_id: &FormId,
        destination: &str,
        record_ids: &[String],
        sink: &dyn ProgressSink,
        cancel: &CancelFlag,
    ) -> Result<UploadOutcome, SyncError> {
        let _guard = self
            .upload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut remap = self.remap.lock().unwrap_or_else(PoisonError::into_inner);
        upload::upload_instances(
            &self.transport,
            &mut *instances,
            form_id,
            destination,
            record_ids,
            &mut remap,
            sink,
            cancel,
        )
    }
}
