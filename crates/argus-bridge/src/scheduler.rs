//! Publication scheduler.
//!
//! One pass per host tick: every subscribed topic is snapshotted at most
//! once, each subscriber's cadence decides whether it is due, and a single
//! pre-encoded envelope per topic is shared by every session that receives
//! it. Enqueueing never blocks; a full session queue drops the delivery and
//! leaves that subscriber's delivery state untouched so it is retried on the
//! next pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use argus_core::{
    Cadence, ContentHash, EncodeError, Envelope, LocalSinkId, PreEncoded, SnapshotProvider,
};
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::metrics::{PASS_DURATION_SECONDS, SNAPSHOTS_DELIVERED_TOTAL};
use crate::overlay::RenderSink;
use crate::registry::{Subscriber, SubscriptionRegistry};
use crate::session::SessionManager;

/// Outcome of one scheduling pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Host tick the pass ran for.
    pub tick: u64,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Snapshots the provider returned.
    pub snapshots: usize,
    /// Deliveries admitted to a session queue or handed to a local sink.
    pub delivered: usize,
    /// Subscribers whose cadence said "not yet", or whose session is gone.
    pub skipped: usize,
    /// Due deliveries refused by a full or draining session queue.
    pub dropped: usize,
}

#[derive(Clone, Copy, Debug)]
struct Delivery {
    at: Instant,
    hash: Option<ContentHash>,
}

/// Drives snapshot publication.
pub struct PublicationScheduler {
    provider: Arc<dyn SnapshotProvider>,
    registry: Arc<SubscriptionRegistry>,
    manager: Arc<SessionManager>,
    sinks: RwLock<HashMap<LocalSinkId, Arc<dyn RenderSink>>>,
    deliveries: Mutex<HashMap<(Subscriber, String), Delivery>>,
    next_tick: AtomicU64,
    encode: fn(&Envelope) -> Result<PreEncoded, EncodeError>,
}

impl PublicationScheduler {
    /// Scheduler over the manager's provider and registry.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            provider: manager.provider().clone(),
            registry: manager.registry().clone(),
            manager,
            sinks: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            next_tick: AtomicU64::new(0),
            encode: PreEncoded::new,
        }
    }

    /// Run a pass at an auto-incremented tick.
    pub fn tick(&self) -> PassReport {
        let tick = self.next_tick.fetch_add(1, Ordering::Relaxed);
        self.run_pass(tick)
    }

    /// Run a pass for `tick` now.
    pub fn run_pass(&self, tick: u64) -> PassReport {
        self.run_pass_at(tick, Instant::now())
    }

    /// Run a pass for `tick` as if the clock read `now`.
    pub fn run_pass_at(&self, tick: u64, now: Instant) -> PassReport {
        let started = std::time::Instant::now();
        let index = self.registry.snapshot();
        let sinks = self.sinks.read().clone();
        let mut deliveries = self.deliveries.lock();
        let mut report = PassReport {
            tick,
            ..PassReport::default()
        };

        for topic in index.topics() {
            let subscribers = index.subscribers(topic);
            report.topics += 1;
            let Some(snapshot) = self.provider.snapshot(topic, tick) else {
                report.skipped += subscribers.len();
                continue;
            };
            report.snapshots += 1;

            let hash = subscribers
                .iter()
                .any(|(_, cadence)| *cadence == Cadence::OnChange)
                .then(|| snapshot.content_hash());
            let snapshot = Arc::new(snapshot);
            // Encoded on first session delivery; `Some(None)` after a failure.
            let mut encoded: Option<Option<Arc<PreEncoded>>> = None;

            for (subscriber, cadence) in subscribers {
                let key = (subscriber, topic.to_owned());
                if !is_due(cadence, deliveries.get(&key), now, hash) {
                    report.skipped += 1;
                    continue;
                }

                let delivered = match &key.0 {
                    Subscriber::Session(id) => {
                        let Some(session) = self.manager.get(id) else {
                            report.skipped += 1;
                            continue;
                        };
                        let body = encoded.get_or_insert_with(|| {
                            let envelope = Envelope::telemetry(topic, snapshot.to_payload());
                            (self.encode)(&envelope)
                                .map(Arc::new)
                                .inspect_err(|e| {
                                    error!(topic, error = %e, "failed to encode snapshot for sessions");
                                })
                                .ok()
                        });
                        let Some(body) = body.clone() else {
                            report.dropped += 1;
                            continue;
                        };
                        session.enqueue_telemetry(body).is_admitted()
                    }
                    Subscriber::Local(id) => match sinks.get(id) {
                        Some(sink) => {
                            sink.render(snapshot.clone());
                            true
                        }
                        None => false,
                    },
                };

                if delivered {
                    report.delivered += 1;
                    let _ = deliveries.insert(key, Delivery { at: now, hash });
                } else {
                    report.dropped += 1;
                }
            }
        }

        deliveries.retain(|(subscriber, topic), _| index.contains(subscriber, topic));
        drop(deliveries);

        counter!(SNAPSHOTS_DELIVERED_TOTAL).increment(report.delivered as u64);
        histogram!(PASS_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        trace!(?report, "scheduling pass");
        report
    }

    /// Register a local sink for `topics` at `cadence`.
    pub fn attach_sink(&self, sink: Arc<dyn RenderSink>, topics: &[&str], cadence: Cadence) -> LocalSinkId {
        let id = LocalSinkId::new();
        let _ = self.sinks.write().insert(id.clone(), sink);
        for topic in topics {
            let _ = self
                .registry
                .subscribe(Subscriber::Local(id.clone()), topic, cadence);
        }
        debug!(sink_id = %id, ?topics, cadence = cadence.label(), "local sink attached");
        id
    }

    /// Remove a local sink and its subscriptions. Returns whether it existed.
    pub fn detach_sink(&self, id: &LocalSinkId) -> bool {
        let existed = self.sinks.write().remove(id).is_some();
        let _ = self.registry.remove_subscriber(&Subscriber::Local(id.clone()));
        existed
    }

    /// Subscriptions with recorded delivery state.
    pub fn tracked_deliveries(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Drive passes from a timer until `cancel` fires.
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(interval_ms = interval.as_millis(), "scheduler ticker started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = scheduler.tick();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            debug!("scheduler ticker stopped");
        })
    }
}

fn is_due(cadence: Cadence, last: Option<&Delivery>, now: Instant, hash: Option<ContentHash>) -> bool {
    let Some(last) = last else {
        return true;
    };
    match cadence {
        Cadence::EveryTick => true,
        Cadence::Throttled { .. } => cadence
            .min_interval()
            .is_none_or(|min| now.saturating_duration_since(last.at) >= min),
        Cadence::OnChange => last.hash.is_none() || last.hash != hash,
    }
}
