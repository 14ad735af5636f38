//! Local render sinks and the optional in-process overlay mirror.

use std::sync::Arc;

use argus_core::Snapshot;

/// In-process subscriber. The scheduler hands it the shared snapshot
/// instead of an encoded envelope.
///
/// Called on the scheduling pass; implementations must not block and must
/// not call back into the scheduler.
pub trait RenderSink: Send + Sync {
    /// Receive one snapshot.
    fn render(&self, snapshot: Arc<Snapshot>);
}

#[cfg(feature = "overlay")]
pub use mirror::OverlayMirror;

#[cfg(feature = "overlay")]
mod mirror {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use argus_core::{Cadence, LocalSinkId, Snapshot};
    use parking_lot::RwLock;
    use tokio::sync::mpsc;
    use tracing::trace;

    use super::RenderSink;
    use crate::scheduler::PublicationScheduler;

    /// Keeps the latest snapshot of each displayed topic for immediate-mode
    /// reads and forwards updates on a bounded, lossy channel.
    pub struct OverlayMirror {
        latest: RwLock<BTreeMap<String, Arc<Snapshot>>>,
        updates: mpsc::Sender<Arc<Snapshot>>,
    }

    impl OverlayMirror {
        /// Mirror `topics` with on-change cadence.
        ///
        /// Returns the mirror, its sink id (for detaching) and the update
        /// channel. Updates that do not fit in `capacity` are dropped; the
        /// latest value stays readable through [`latest`](Self::latest).
        pub fn attach(
            scheduler: &PublicationScheduler,
            topics: &[&str],
            capacity: usize,
        ) -> (Arc<Self>, LocalSinkId, mpsc::Receiver<Arc<Snapshot>>) {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let mirror = Arc::new(Self {
                latest: RwLock::new(BTreeMap::new()),
                updates: tx,
            });
            let id = scheduler.attach_sink(mirror.clone(), topics, Cadence::OnChange);
            (mirror, id, rx)
        }

        /// Latest snapshot of `topic`, if one arrived.
        pub fn latest(&self, topic: &str) -> Option<Arc<Snapshot>> {
            self.latest.read().get(topic).cloned()
        }

        /// Latest snapshot of every mirrored topic, in topic order.
        pub fn all(&self) -> Vec<Arc<Snapshot>> {
            self.latest.read().values().cloned().collect()
        }
    }

    impl RenderSink for OverlayMirror {
        fn render(&self, snapshot: Arc<Snapshot>) {
            let _ = self
                .latest
                .write()
                .insert(snapshot.topic.clone(), snapshot.clone());
            if self.updates.try_send(snapshot).is_err() {
                trace!("overlay update channel full, dropping update");
            }
        }
    }

}
