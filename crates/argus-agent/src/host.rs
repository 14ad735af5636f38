//! Demo host: a simulated frame loop publishing `clock`, `health` and
//! `perf`, with commands to tune and read the performance lens.

use std::sync::Arc;

use argus_bridge::CommandDispatcher;
use argus_core::perf::{DEFAULT_WINDOW, PerfThresholds, PerfTracker};
use argus_core::{CommandError, Snapshot, SnapshotProvider};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Topics the demo host publishes.
pub const TOPICS: &[&str] = &["clock", "health", "perf"];

#[derive(Debug)]
struct World {
    frame: u64,
    elapsed_ms: f64,
    hp: i64,
}

/// Simulated game state plus its performance tracker.
#[derive(Debug)]
pub struct DemoHost {
    world: Mutex<World>,
    perf: Mutex<PerfTracker>,
}

impl DemoHost {
    /// Host with the given performance gates.
    pub fn new(thresholds: PerfThresholds) -> Self {
        Self {
            world: Mutex::new(World {
                frame: 0,
                elapsed_ms: 0.0,
                hp: 100,
            }),
            perf: Mutex::new(PerfTracker::new(thresholds, DEFAULT_WINDOW)),
        }
    }

    /// Advance one frame that took `frame_time_ms`.
    ///
    /// Health regenerates by one point every 60 frames, so on-change
    /// subscribers see occasional updates rather than one per frame.
    pub fn advance(&self, frame_time_ms: f64, memory_mb: f64) {
        let _ = self.perf.lock().record(frame_time_ms, memory_mb);
        let mut world = self.world.lock();
        world.frame += 1;
        world.elapsed_ms += frame_time_ms;
        if world.frame % 60 == 0 && world.hp < 100 {
            world.hp += 1;
        }
    }

    /// Current health.
    pub fn hp(&self) -> i64 {
        self.world.lock().hp
    }

    fn set_hp(&self, hp: i64) -> i64 {
        let mut world = self.world.lock();
        world.hp = hp.clamp(0, 100);
        world.hp
    }
}

impl SnapshotProvider for DemoHost {
    fn topics(&self) -> Vec<String> {
        TOPICS.iter().map(|t| (*t).to_owned()).collect()
    }

    fn snapshot(&self, topic: &str, tick: u64) -> Option<Snapshot> {
        let value = match topic {
            "clock" => {
                let world = self.world.lock();
                json!({ "frame": world.frame, "elapsedMs": world.elapsed_ms })
            }
            "health" => json!({ "hp": self.hp() }),
            "perf" => serde_json::to_value(self.perf.lock().report()).ok()?,
            _ => return None,
        };
        Some(Snapshot::new(topic, tick, value))
    }
}

/// Register the host's commands.
///
/// - `perf.report`: current statistics
/// - `perf.thresholds`: merge the given gates over the current ones
/// - `perf.reset`: clear samples and counters
/// - `health.set`: `{hp}`, clamped to `0..=100`
pub fn register_commands(host: &Arc<DemoHost>, dispatcher: &mut CommandDispatcher) {
    let h = host.clone();
    dispatcher.register_fn("perf", "report", move |_args, _ctx| {
        let report = h.perf.lock().report();
        async move { serde_json::to_value(report).map_err(|e| CommandError::failed(e.to_string())) }
    });

    let h = host.clone();
    dispatcher.register_fn("perf", "thresholds", move |args, _ctx| {
        let result = update_thresholds(&h, args);
        async move { result }
    });

    let h = host.clone();
    dispatcher.register_fn("perf", "reset", move |_args, _ctx| {
        h.perf.lock().reset();
        async move { Ok::<_, CommandError>(json!({ "reset": true })) }
    });

    let h = host.clone();
    dispatcher.register_fn("health", "set", move |args, _ctx| {
        let result = args
            .get("hp")
            .and_then(Value::as_i64)
            .ok_or_else(|| CommandError::invalid_args("expected {\"hp\": <integer>}"))
            .map(|hp| json!({ "hp": h.set_hp(hp) }));
        async move { result }
    });
}

fn update_thresholds(host: &DemoHost, args: Value) -> Result<Value, CommandError> {
    let mut perf = host.perf.lock();
    let mut merged = serde_json::to_value(perf.thresholds())
        .map_err(|e| CommandError::failed(e.to_string()))?;
    match (merged.as_object_mut(), args) {
        (Some(current), Value::Object(patch)) => current.extend(patch),
        (_, Value::Null) => {}
        _ => return Err(CommandError::invalid_args("thresholds must be an object")),
    }
    let thresholds: PerfThresholds = serde_json::from_value(merged)
        .map_err(|e| CommandError::invalid_args(format!("invalid thresholds: {e}")))?;
    perf.set_thresholds(thresholds);
    serde_json::to_value(thresholds).map_err(|e| CommandError::failed(e.to_string()))
}

/// Resident set size in megabytes, where the platform exposes it.
#[allow(clippy::cast_precision_loss)]
pub fn resident_memory_mb() -> f64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| statm.split_whitespace().nth(1)?.parse::<u64>().ok())
        .map_or(0.0, |pages| (pages * 4096) as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::{CommandRequest, SessionId};

    fn host() -> Arc<DemoHost> {
        Arc::new(DemoHost::new(PerfThresholds::default()))
    }

    fn dispatcher(host: &Arc<DemoHost>) -> CommandDispatcher {
        let mut d = CommandDispatcher::new();
        register_commands(host, &mut d);
        d
    }

    #[test]
    fn publishes_every_topic() {
        let h = host();
        for topic in TOPICS {
            let snapshot = h.snapshot(topic, 7).unwrap();
            assert_eq!(snapshot.tick, 7);
        }
        assert!(h.snapshot("nope", 0).is_none());
    }

    #[test]
    fn health_regenerates_slowly() {
        let h = host();
        let _ = h.set_hp(90);
        for _ in 0..59 {
            h.advance(16.0, 100.0);
        }
        assert_eq!(h.hp(), 90);
        h.advance(16.0, 100.0);
        assert_eq!(h.hp(), 91);
        let before = h.snapshot("health", 1).unwrap().content_hash();
        h.advance(16.0, 100.0);
        assert_eq!(h.snapshot("health", 2).unwrap().content_hash(), before);
    }

    #[test]
    fn perf_topic_reports_tracker() {
        let h = host();
        h.advance(20.0, 512.0);
        let value = h.snapshot("perf", 1).unwrap().value;
        assert_eq!(value["samples"], 1);
        assert_eq!(value["peakMemoryMb"], 512.0);
        assert_eq!(value["passedThresholds"], true);
    }

    #[tokio::test]
    async fn commands_are_registered() {
        let h = host();
        let d = dispatcher(&h);
        assert_eq!(
            d.commands(),
            vec!["health.set", "perf.report", "perf.reset", "perf.thresholds"]
        );

        let session = SessionId::new();
        let resp = d
            .dispatch(&session, CommandRequest::new("1", "health", "set", json!({"hp": 250})))
            .await;
        assert_eq!(resp.result, Some(json!({"hp": 100})));

        let resp = d
            .dispatch(&session, CommandRequest::new("2", "health", "set", json!({})))
            .await;
        assert_eq!(resp.error_code(), Some("INVALID_ARGS"));
    }

    #[tokio::test]
    async fn thresholds_merge_over_current() {
        let h = host();
        let d = dispatcher(&h);
        let resp = d
            .dispatch(
                &SessionId::new(),
                CommandRequest::new("t", "perf", "thresholds", json!({"minFPS": 55.0})),
            )
            .await;
        let result = resp.result.unwrap();
        assert_eq!(result["minFPS"], 55.0);
        assert_eq!(result["maxMemoryMb"], 2048.0);
        assert!((h.perf.lock().thresholds().min_fps - 55.0).abs() < f64::EPSILON);

        let resp = d
            .dispatch(
                &SessionId::new(),
                CommandRequest::new("u", "perf", "thresholds", json!([1, 2])),
            )
            .await;
        assert_eq!(resp.error_code(), Some("INVALID_ARGS"));
    }
}
