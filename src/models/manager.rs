//! Single-slot-per-role model cache.
//!
//! ## Contract
//!
//! `acquire(role, variant)`:
//!
//! 1. resolves `(role, variant)` in the [`VariantTable`]; unknown pairs fail
//!    with a configuration error before anything is touched;
//! 2. returns a lease on the cached model when that variant is already
//!    resident;
//! 3. otherwise waits until every outstanding lease on the role is dropped,
//!    evicts the resident variant (drop, then [`DeviceReclaimer::reclaim`])
//!    and constructs the new one through the [`ModelFactory`].
//!
//! Models are only reachable through a [`ModelLease`], so at most one
//! instance per role is ever alive. A task must drop its lease before it
//! asks for a different variant of the same role, or the switch never
//! completes.
//!
//! A construction failure leaves the slot empty, so the next request simply
//! tries again. Each role has its own slot and its own mutex: switching the
//! figure interpreter never evicts the page formatter, and two concurrent
//! acquires for the same role are serialised.
//!
//! ## Call gates
//!
//! Holding a lease does not serialise inference. Stages that fan out over
//! pages lock [`ModelManager::call_gate`] around each model call so a single
//! resident model sees one request at a time.

use super::device::DeviceReclaimer;
use super::registry::{ModelRole, VariantSpec, VariantTable};
use super::{FigureInterpreter, PageFormatter};
use crate::error::DocParseError;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

/// A constructed model, typed by role.
#[derive(Clone)]
pub enum ModelHandle {
    FigureInterpreter(Arc<dyn FigureInterpreter>),
    PageFormatter(Arc<dyn PageFormatter>),
}

impl ModelHandle {
    pub fn role(&self) -> ModelRole {
        match self {
            ModelHandle::FigureInterpreter(_) => ModelRole::FigureInterpreter,
            ModelHandle::PageFormatter(_) => ModelRole::PageFormatter,
        }
    }

    pub(crate) fn as_figure_interpreter(&self) -> Option<Arc<dyn FigureInterpreter>> {
        match self {
            ModelHandle::FigureInterpreter(m) => Some(Arc::clone(m)),
            _ => None,
        }
    }

    pub(crate) fn as_page_formatter(&self) -> Option<Arc<dyn PageFormatter>> {
        match self {
            ModelHandle::PageFormatter(m) => Some(Arc::clone(m)),
            _ => None,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelHandle({})", self.role())
    }
}

/// Shared access to a resident model.
///
/// While any lease on a role is alive, the manager will not evict or
/// replace that role's model.
pub struct ModelLease<T: ?Sized> {
    model: Arc<T>,
    _in_use: OwnedRwLockReadGuard<()>,
}

impl<T: ?Sized> Deref for ModelLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.model
    }
}

impl<T: ?Sized> fmt::Debug for ModelLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModelLease")
    }
}

/// Builds a model for a resolved `(role, variant)`.
///
/// Called on a blocking thread: loading weights is slow and may block.
pub trait ModelFactory: Send + Sync {
    fn construct(
        &self,
        role: ModelRole,
        variant: &str,
        spec: &VariantSpec,
    ) -> Result<ModelHandle, DocParseError>;
}

struct Resident {
    variant: String,
    handle: ModelHandle,
}

struct RoleSlot {
    resident: Mutex<Option<Resident>>,
    /// Read-held by every lease; write-held while the model is swapped.
    in_use: Arc<RwLock<()>>,
    gate: Arc<Mutex<()>>,
}

impl RoleSlot {
    fn new() -> Self {
        Self {
            resident: Mutex::new(None),
            in_use: Arc::new(RwLock::new(())),
            gate: Arc::new(Mutex::new(())),
        }
    }
}

pub struct ModelManager {
    table: VariantTable,
    factory: Arc<dyn ModelFactory>,
    reclaimer: Arc<dyn DeviceReclaimer>,
    slots: HashMap<ModelRole, RoleSlot>,
}

impl fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelManager")
            .field("table", &self.table)
            .field("factory", &"<dyn ModelFactory>")
            .field("reclaimer", &"<dyn DeviceReclaimer>")
            .finish()
    }
}

impl ModelManager {
    pub fn new(
        table: VariantTable,
        factory: Arc<dyn ModelFactory>,
        reclaimer: Arc<dyn DeviceReclaimer>,
    ) -> Self {
        let slots = ModelRole::ALL
            .iter()
            .map(|role| (*role, RoleSlot::new()))
            .collect();
        Self {
            table,
            factory,
            reclaimer,
            slots,
        }
    }

    pub fn table(&self) -> &VariantTable {
        &self.table
    }

    fn slot(&self, role: ModelRole) -> Result<&RoleSlot, DocParseError> {
        self.slots
            .get(&role)
            .ok_or_else(|| DocParseError::UnknownModelRole(role.to_string()))
    }

    /// Lease the requested variant, loading or switching as needed.
    pub async fn acquire(
        &self,
        role: ModelRole,
        variant: &str,
    ) -> Result<ModelLease<ModelHandle>, DocParseError> {
        let (handle, in_use) = self.lease(role, variant).await?;
        Ok(ModelLease {
            model: Arc::new(handle),
            _in_use: in_use,
        })
    }

    async fn lease(
        &self,
        role: ModelRole,
        variant: &str,
    ) -> Result<(ModelHandle, OwnedRwLockReadGuard<()>), DocParseError> {
        let spec = self.table.resolve(role, variant)?.clone();
        let slot = self.slot(role)?;
        let mut resident = slot.resident.lock().await;

        // Writers only exist while `resident` is locked, so this never waits.
        if let Some(current) = resident.as_ref() {
            if current.variant == variant {
                debug!("{role}: '{variant}' already resident");
                let in_use = Arc::clone(&slot.in_use).read_owned().await;
                return Ok((current.handle.clone(), in_use));
            }
        }

        let exclusive = slot.in_use.write().await;
        if let Some(old) = resident.take() {
            info!("{role}: switching '{}' → '{variant}'", old.variant);
            drop(old);
            self.reclaim().await?;
        }

        info!(
            "{role}: loading '{variant}' ({} on {}, {:?})",
            spec.model_id, spec.device, spec.precision
        );
        let factory = Arc::clone(&self.factory);
        let name = variant.to_string();
        let built = tokio::task::spawn_blocking(move || factory.construct(role, &name, &spec))
            .await
            .map_err(|e| DocParseError::Internal(format!("Model construction panicked: {e}")))?;

        let handle = match built {
            Ok(handle) if handle.role() == role => handle,
            Ok(handle) => {
                return Err(DocParseError::ModelConstructionFailed {
                    role: role.to_string(),
                    variant: variant.to_string(),
                    detail: format!("factory returned a {} model", handle.role()),
                })
            }
            Err(e) => {
                warn!("{role}: construction of '{variant}' failed, slot left empty: {e}");
                return Err(e);
            }
        };

        *resident = Some(Resident {
            variant: variant.to_string(),
            handle: handle.clone(),
        });
        drop(exclusive);
        let in_use = Arc::clone(&slot.in_use).read_owned().await;
        Ok((handle, in_use))
    }

    /// Like [`acquire`](Self::acquire) but with the role given by name.
    pub async fn acquire_named(
        &self,
        role: &str,
        variant: &str,
    ) -> Result<ModelLease<ModelHandle>, DocParseError> {
        self.acquire(role.parse()?, variant).await
    }

    pub async fn figure_interpreter(
        &self,
        variant: &str,
    ) -> Result<ModelLease<dyn FigureInterpreter>, DocParseError> {
        let (handle, in_use) = self.lease(ModelRole::FigureInterpreter, variant).await?;
        let model = handle
            .as_figure_interpreter()
            .ok_or_else(|| DocParseError::Internal("figure interpreter slot holds wrong role".into()))?;
        Ok(ModelLease {
            model,
            _in_use: in_use,
        })
    }

    pub async fn page_formatter(
        &self,
        variant: &str,
    ) -> Result<ModelLease<dyn PageFormatter>, DocParseError> {
        let (handle, in_use) = self.lease(ModelRole::PageFormatter, variant).await?;
        let model = handle
            .as_page_formatter()
            .ok_or_else(|| DocParseError::Internal("page formatter slot holds wrong role".into()))?;
        Ok(ModelLease {
            model,
            _in_use: in_use,
        })
    }

    /// Variant currently resident for `role`, if any.
    pub async fn resident_variant(&self, role: ModelRole) -> Option<String> {
        let slot = self.slots.get(&role)?;
        let guard = slot.resident.lock().await;
        guard.as_ref().map(|r| r.variant.clone())
    }

    /// Evict whatever is resident for `role` and reclaim device memory.
    ///
    /// Waits for outstanding leases on `role` to be dropped.
    pub async fn release(&self, role: ModelRole) -> Result<(), DocParseError> {
        let slot = self.slot(role)?;
        let mut resident = slot.resident.lock().await;
        let _exclusive = slot.in_use.write().await;
        if let Some(old) = resident.take() {
            info!("{role}: releasing '{}'", old.variant);
            drop(old);
            self.reclaim().await?;
        }
        Ok(())
    }

    /// Mutex serialising inference calls into `role`'s resident model.
    pub fn call_gate(&self, role: ModelRole) -> Arc<Mutex<()>> {
        match self.slots.get(&role) {
            Some(slot) => Arc::clone(&slot.gate),
            None => Arc::new(Mutex::new(())),
        }
    }

    async fn reclaim(&self) -> Result<(), DocParseError> {
        let reclaimer = Arc::clone(&self.reclaimer);
        tokio::task::spawn_blocking(move || reclaimer.reclaim())
            .await
            .map_err(|e| DocParseError::Internal(format!("Device reclamation panicked: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Generation, ModelCallError};
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<String>>>;

    struct Echo;

    #[async_trait]
    impl FigureInterpreter for Echo {
        async fn interpret(&self, _f: &DynamicImage) -> Result<Generation, ModelCallError> {
            Ok(Generation::success("Type: chart"))
        }
    }

    #[async_trait]
    impl PageFormatter for Echo {
        fn max_new_tokens(&self) -> usize {
            16
        }
        async fn format(
            &self,
            text: &str,
            _img: &DynamicImage,
        ) -> Result<Generation, ModelCallError> {
            Ok(Generation::success(text))
        }
    }

    struct RecordingFactory {
        log: Log,
        fail_next: AtomicBool,
    }

    impl ModelFactory for RecordingFactory {
        fn construct(
            &self,
            role: ModelRole,
            variant: &str,
            _spec: &VariantSpec,
        ) -> Result<ModelHandle, DocParseError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                self.log.lock().unwrap().push(format!("fail {role}/{variant}"));
                return Err(DocParseError::ModelConstructionFailed {
                    role: role.to_string(),
                    variant: variant.to_string(),
                    detail: "out of memory".into(),
                });
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("construct {role}/{variant}"));
            Ok(match role {
                ModelRole::FigureInterpreter => ModelHandle::FigureInterpreter(Arc::new(Echo)),
                ModelRole::PageFormatter => ModelHandle::PageFormatter(Arc::new(Echo)),
            })
        }
    }

    struct RecordingReclaimer(Log);

    impl DeviceReclaimer for RecordingReclaimer {
        fn collect_garbage(&self) {
            self.0.lock().unwrap().push("gc".into());
        }
        fn release_cached(&self) {
            self.0.lock().unwrap().push("release_cached".into());
        }
        fn synchronize(&self) {
            self.0.lock().unwrap().push("synchronize".into());
        }
    }

    fn manager() -> (ModelManager, Log, Arc<RecordingFactory>) {
        let log: Log = Arc::new(StdMutex::new(Vec::new()));
        let factory = Arc::new(RecordingFactory {
            log: Arc::clone(&log),
            fail_next: AtomicBool::new(false),
        });
        let mgr = ModelManager::new(
            VariantTable::builtin(),
            factory.clone(),
            Arc::new(RecordingReclaimer(Arc::clone(&log))),
        );
        (mgr, log, factory)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn same_variant_is_constructed_once() {
        let (mgr, log, _) = manager();
        mgr.acquire(ModelRole::FigureInterpreter, "base").await.unwrap();
        mgr.acquire(ModelRole::FigureInterpreter, "base").await.unwrap();
        assert_eq!(entries(&log), vec!["construct figure_interpreter/base"]);
    }

    #[tokio::test]
    async fn switching_releases_then_constructs_once() {
        let (mgr, log, _) = manager();
        mgr.acquire(ModelRole::FigureInterpreter, "base").await.unwrap();
        mgr.acquire(ModelRole::PageFormatter, "base").await.unwrap();
        log.lock().unwrap().clear();

        mgr.acquire(ModelRole::FigureInterpreter, "ft").await.unwrap();
        assert_eq!(
            entries(&log),
            vec![
                "gc",
                "release_cached",
                "synchronize",
                "construct figure_interpreter/ft"
            ]
        );
        assert_eq!(
            mgr.resident_variant(ModelRole::PageFormatter).await.as_deref(),
            Some("base")
        );
        assert_eq!(
            mgr.resident_variant(ModelRole::FigureInterpreter).await.as_deref(),
            Some("ft")
        );
    }

    #[tokio::test]
    async fn unknown_variant_touches_nothing() {
        let (mgr, log, _) = manager();
        mgr.acquire(ModelRole::PageFormatter, "base").await.unwrap();
        let err = mgr
            .acquire(ModelRole::PageFormatter, "huge")
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(entries(&log), vec!["construct page_formatter/base"]);
        assert_eq!(
            mgr.resident_variant(ModelRole::PageFormatter).await.as_deref(),
            Some("base")
        );
    }

    #[tokio::test]
    async fn unknown_role_name_is_config_error() {
        let (mgr, _, _) = manager();
        let err = mgr.acquire_named("summariser", "base").await.unwrap_err();
        assert!(matches!(err, DocParseError::UnknownModelRole(_)));
    }

    #[tokio::test]
    async fn failed_construction_leaves_slot_empty_and_retries_cleanly() {
        let (mgr, log, factory) = manager();
        factory.fail_next.store(true, Ordering::SeqCst);
        assert!(mgr.acquire(ModelRole::PageFormatter, "quantized").await.is_err());
        assert_eq!(mgr.resident_variant(ModelRole::PageFormatter).await, None);

        mgr.acquire(ModelRole::PageFormatter, "quantized").await.unwrap();
        assert_eq!(
            entries(&log),
            vec![
                "fail page_formatter/quantized",
                "construct page_formatter/quantized"
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_of_one_role_are_serialised() {
        let (mgr, log, _) = manager();
        let mgr = Arc::new(mgr);
        let a = {
            let m = Arc::clone(&mgr);
            tokio::spawn(async move { m.acquire(ModelRole::FigureInterpreter, "base").await })
        };
        let b = {
            let m = Arc::clone(&mgr);
            tokio::spawn(async move { m.acquire(ModelRole::FigureInterpreter, "base").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(entries(&log), vec!["construct figure_interpreter/base"]);
    }

    /// Counts live model instances across construction and drop.
    #[derive(Default)]
    struct Census {
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Counted(Arc<Census>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FigureInterpreter for Counted {
        async fn interpret(&self, _f: &DynamicImage) -> Result<Generation, ModelCallError> {
            Ok(Generation::success("Type: table"))
        }
    }

    struct CountingFactory(Arc<Census>);

    impl ModelFactory for CountingFactory {
        fn construct(
            &self,
            _role: ModelRole,
            _variant: &str,
            _spec: &VariantSpec,
        ) -> Result<ModelHandle, DocParseError> {
            let live = self.0.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(live, Ordering::SeqCst);
            Ok(ModelHandle::FigureInterpreter(Arc::new(Counted(Arc::clone(&self.0)))))
        }
    }

    #[tokio::test]
    async fn switch_waits_for_outstanding_leases() {
        let census = Arc::new(Census::default());
        let mgr = Arc::new(ModelManager::new(
            VariantTable::builtin(),
            Arc::new(CountingFactory(Arc::clone(&census))),
            Arc::new(RecordingReclaimer(Arc::new(StdMutex::new(Vec::new())))),
        ));

        let base = mgr.figure_interpreter("base").await.unwrap();
        let switch = {
            let m = Arc::clone(&mgr);
            tokio::spawn(async move {
                m.figure_interpreter("ft").await.map(|_| ())
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!switch.is_finished());
        assert_eq!(census.live.load(Ordering::SeqCst), 1);

        // In-flight call on the old model still works while the switch waits.
        let out = base.interpret(&DynamicImage::new_rgb8(2, 2)).await.unwrap();
        assert_eq!(out.text, "Type: table");
        drop(base);

        switch.await.unwrap().unwrap();
        assert_eq!(
            mgr.resident_variant(ModelRole::FigureInterpreter).await.as_deref(),
            Some("ft")
        );
        assert_eq!(census.live.load(Ordering::SeqCst), 1);
        assert_eq!(census.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typed_accessors_and_release() {
        let (mgr, log, _) = manager();
        let fig = mgr.figure_interpreter("base").await.unwrap();
        let out = fig.interpret(&DynamicImage::new_rgb8(2, 2)).await.unwrap();
        assert_eq!(out.text, "Type: chart");
        drop(fig);

        mgr.release(ModelRole::FigureInterpreter).await.unwrap();
        assert_eq!(mgr.resident_variant(ModelRole::FigureInterpreter).await, None);
        assert_eq!(entries(&log).last().map(String::as_str), Some("synchronize"));

        let gate_a = mgr.call_gate(ModelRole::PageFormatter);
        let gate_b = mgr.call_gate(ModelRole::PageFormatter);
        assert!(Arc::ptr_eq(&gate_a, &gate_b));
    }
}
