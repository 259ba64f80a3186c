//! Device-memory reclamation run between evicting one model and loading
//! the next.
//!
//! Dropping the last reference to a model does not return its device memory
//! immediately: the allocator keeps a cache and kernels may still be in
//! flight. The manager therefore runs the three steps of
//! [`DeviceReclaimer::reclaim`] in order, on a blocking thread, before it
//! constructs the replacement.

use tracing::debug;

pub trait DeviceReclaimer: Send + Sync {
    /// Finalise any objects still waiting on collection.
    fn collect_garbage(&self);

    /// Hand cached device allocations back to the driver.
    fn release_cached(&self);

    /// Block until every queued device operation has completed.
    fn synchronize(&self);

    fn reclaim(&self) {
        self.collect_garbage();
        self.release_cached();
        self.synchronize();
    }
}

/// Reclaimer for backends whose memory lives out of process (served models).
///
/// There is nothing local to free, so each step only records that it ran.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReclaimer;

impl DeviceReclaimer for TracingReclaimer {
    fn collect_garbage(&self) {
        debug!("reclaim: collect garbage");
    }

    fn release_cached(&self) {
        debug!("reclaim: release cached device allocations");
    }

    fn synchronize(&self) {
        debug!("reclaim: synchronize device");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    impl DeviceReclaimer for Recorder {
        fn collect_garbage(&self) {
            self.0.lock().unwrap().push("gc");
        }
        fn release_cached(&self) {
            self.0.lock().unwrap().push("release");
        }
        fn synchronize(&self) {
            self.0.lock().unwrap().push("sync");
        }
    }

    #[test]
    fn reclaim_runs_steps_in_order() {
        let r = Recorder::default();
        r.reclaim();
        assert_eq!(*r.0.lock().unwrap(), vec!["gc", "release", "sync"]);
    }

    #[test]
    fn tracing_reclaimer_is_a_no_op() {
        TracingReclaimer.reclaim();
    }
}
