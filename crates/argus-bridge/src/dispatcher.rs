//! Command dispatch with per-request timeouts.
//!
//! Every accepted request yields exactly one [`CommandResponse`]: the
//! handler's result, a timeout error, or a refusal. The pending table is the
//! arbiter. Whoever removes the entry first (the handler task on completion,
//! or the dispatcher on timeout) decides the response; the loser's result is
//! discarded.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use argus_core::errors::{DUPLICATE_REQUEST, HANDLER_PANICKED, INTERNAL_ERROR};
use argus_core::{
    BridgeError, CONTROL_TOPIC, CommandError, CommandRequest, CommandResponse, SessionId,
};
use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::metrics::{
    COMMAND_DURATION_SECONDS, COMMAND_ERRORS_TOTAL, COMMAND_LATE_RESULTS_TOTAL,
    COMMAND_TIMEOUTS_TOTAL, COMMANDS_TOTAL,
};

/// Default per-request timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Who is asking, passed to every handler.
#[derive(Clone, Debug)]
pub struct CommandContext {
    /// Originating session.
    pub session_id: SessionId,
    /// Correlation id of the request.
    pub request_id: String,
    /// Command topic.
    pub topic: String,
    /// Command verb.
    pub verb: String,
}

/// Host-side command handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Execute the command.
    async fn handle(&self, args: Value, ctx: &CommandContext) -> Result<Value, CommandError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
{
    async fn handle(&self, args: Value, ctx: &CommandContext) -> Result<Value, CommandError> {
        (self.0)(args, ctx.clone()).await
    }
}

type PendingKey = (SessionId, String);

struct PendingEntry {
    tx: oneshot::Sender<CommandResponse>,
    task: Option<AbortHandle>,
}

/// Maps `(topic, verb)` to handlers and runs them.
pub struct CommandDispatcher {
    handlers: HashMap<(String, String), Arc<dyn CommandHandler>>,
    pending: Arc<Mutex<HashMap<PendingKey, PendingEntry>>>,
    timeout: Duration,
}

impl CommandDispatcher {
    /// Empty dispatcher with the default timeout.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Replace the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a handler for `topic.verb`, replacing any previous one.
    ///
    /// The `bridge` topic is reserved for control verbs; registrations on it
    /// are ignored.
    pub fn register(&mut self, topic: &str, verb: &str, handler: impl CommandHandler + 'static) {
        if topic == CONTROL_TOPIC {
            warn!(topic, verb, "refusing to register a handler on the reserved control topic");
            return;
        }
        let _ = self
            .handlers
            .insert((topic.to_owned(), verb.to_owned()), Arc::new(handler));
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, topic: &str, verb: &str, f: F)
    where
        F: Fn(Value, CommandContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CommandError>> + Send + 'static,
    {
        self.register(topic, verb, FnHandler(f));
    }

    /// Registered commands as sorted `topic.verb` names.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .map(|(topic, verb)| format!("{topic}.{verb}"))
            .collect();
        names.sort();
        names
    }

    /// Whether `topic.verb` has a handler.
    pub fn has_command(&self, topic: &str, verb: &str) -> bool {
        self.handlers
            .contains_key(&(topic.to_owned(), verb.to_owned()))
    }

    /// Requests currently awaiting a handler result.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run one request to completion and return its single response.
    pub async fn dispatch(&self, session_id: &SessionId, request: CommandRequest) -> CommandResponse {
        let name = request.name();
        counter!(COMMANDS_TOTAL, "command" => name.clone()).increment(1);

        let Some(handler) = self
            .handlers
            .get(&(request.topic.clone(), request.verb.clone()))
            .cloned()
        else {
            let err = BridgeError::UnknownCommand {
                topic: request.topic,
                verb: request.verb,
            };
            counter!(COMMAND_ERRORS_TOTAL, "command" => name, "code" => err.code()).increment(1);
            return CommandResponse::from_body(request.id, err.to_error_body());
        };

        let key: PendingKey = (session_id.clone(), request.id.clone());
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&key) {
                drop(pending);
                counter!(COMMAND_ERRORS_TOTAL, "command" => name, "code" => DUPLICATE_REQUEST).increment(1);
                return CommandResponse::error(
                    request.id.clone(),
                    DUPLICATE_REQUEST,
                    format!("request '{}' is already in flight", request.id),
                );
            }
            let _ = pending.insert(key.clone(), PendingEntry { tx, task: None });
        }

        let ctx = CommandContext {
            session_id: session_id.clone(),
            request_id: request.id.clone(),
            topic: request.topic,
            verb: request.verb,
        };
        let task = tokio::spawn(run_handler(
            handler,
            request.args,
            ctx,
            key.clone(),
            self.pending.clone(),
        ));
        if let Some(entry) = self.pending.lock().get_mut(&key) {
            entry.task = Some(task.abort_handle());
        }

        let start = Instant::now();
        let response = match tokio::time::timeout(self.timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_closed)) => CommandResponse::error(request.id, INTERNAL_ERROR, "session closed"),
            Err(_elapsed) => {
                // The handler may have completed between the deadline and
                // this lock; if it already took the entry, its result wins.
                let timed_out = self.pending.lock().remove(&key).is_some();
                if timed_out {
                    counter!(COMMAND_TIMEOUTS_TOTAL, "command" => name.clone()).increment(1);
                    warn!(command = %name, request_id = %request.id, timeout_ms = self.timeout.as_millis(), "command timed out");
                    let err = BridgeError::CommandTimeout {
                        id: request.id.clone(),
                        timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    };
                    CommandResponse::from_body(request.id, err.to_error_body())
                } else {
                    rx.try_recv().unwrap_or_else(|_| {
                        CommandResponse::error(request.id, INTERNAL_ERROR, "session closed")
                    })
                }
            }
        };

        if let Some(code) = response.error_code() {
            counter!(COMMAND_ERRORS_TOTAL, "command" => name.clone(), "code" => code.to_owned()).increment(1);
        }
        histogram!(COMMAND_DURATION_SECONDS, "command" => name).record(start.elapsed().as_secs_f64());
        response
    }

    /// Fail every in-flight request of a closing session and stop its
    /// handlers. Returns how many were cancelled.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let cancelled: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .keys()
                .filter(|(sid, _)| sid == session_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        for entry in &cancelled {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
        if !cancelled.is_empty() {
            debug!(%session_id, count = cancelled.len(), "cancelled in-flight commands");
        }
        cancelled.len()
    }
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_handler(
    handler: Arc<dyn CommandHandler>,
    args: Value,
    ctx: CommandContext,
    key: PendingKey,
    pending: Arc<Mutex<HashMap<PendingKey, PendingEntry>>>,
) {
    let outcome = AssertUnwindSafe(handler.handle(args, &ctx)).catch_unwind().await;
    let response = match outcome {
        Ok(Ok(result)) => CommandResponse::success(ctx.request_id.clone(), result),
        Ok(Err(err)) => CommandResponse::from_body(ctx.request_id.clone(), err.to_error_body()),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(topic = %ctx.topic, verb = %ctx.verb, request_id = %ctx.request_id, %message, "command handler panicked");
            CommandResponse::error(ctx.request_id.clone(), HANDLER_PANICKED, message)
        }
    };

    // Send under the lock so a dispatcher that finds the entry gone can rely
    // on the response already being in the channel.
    let mut pending = pending.lock();
    if let Some(entry) = pending.remove(&key) {
        let _ = entry.tx.send(response);
    } else {
        drop(pending);
        counter!(COMMAND_LATE_RESULTS_TOTAL).increment(1);
        debug!(topic = %ctx.topic, verb = %ctx.verb, request_id = %ctx.request_id, "discarding late command result");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::errors::{COMMAND_TIMEOUT, HANDLER_FAILED, INVALID_ARGS, UNKNOWN_COMMAND};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, args: Value, ctx: &CommandContext) -> Result<Value, CommandError> {
            Ok(json!({ "args": args, "verb": ctx.verb }))
        }
    }

    struct SlowHandler(Duration);

    #[async_trait]
    impl CommandHandler for SlowHandler {
        async fn handle(&self, _args: Value, _ctx: &CommandContext) -> Result<Value, CommandError> {
            tokio::time::sleep(self.0).await;
            Ok(json!("late"))
        }
    }

    fn sid() -> SessionId {
        SessionId::from("ses_test")
    }

    fn req(id: &str, topic: &str, verb: &str) -> CommandRequest {
        CommandRequest::new(id, topic, verb, json!({"x": 1}))
    }

    #[tokio::test]
    async fn dispatch_success() {
        let mut d = CommandDispatcher::new();
        d.register("scene", "echo", EchoHandler);
        let resp = d.dispatch(&sid(), req("r1", "scene", "echo")).await;
        assert!(resp.success);
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.result.unwrap()["args"]["x"], 1);
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_command() {
        let d = CommandDispatcher::new();
        let resp = d.dispatch(&sid(), req("r1", "scene", "nope")).await;
        assert_eq!(resp.error_code(), Some(UNKNOWN_COMMAND));
        assert_eq!(resp.id, "r1");
    }

    #[tokio::test]
    async fn handler_errors_map_to_codes() {
        let mut d = CommandDispatcher::new();
        d.register_fn("scene", "bad", |_, _| async { Err::<Value, _>(CommandError::invalid_args("missing 'n'")) });
        d.register_fn("scene", "fail", |_, _| async { Err::<Value, _>(CommandError::failed("boom")) });
        let resp = d.dispatch(&sid(), req("a", "scene", "bad")).await;
        assert_eq!(resp.error_code(), Some(INVALID_ARGS));
        assert_eq!(resp.error.unwrap().message, "missing 'n'");
        let resp = d.dispatch(&sid(), req("b", "scene", "fail")).await;
        assert_eq!(resp.error_code(), Some(HANDLER_FAILED));
    }

    #[tokio::test]
    async fn panicking_handler_yields_error_response() {
        let mut d = CommandDispatcher::new();
        d.register_fn("scene", "panic", |_, _| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, CommandError>(Value::Null)
        });
        let resp = d.dispatch(&sid(), req("p", "scene", "panic")).await;
        assert_eq!(resp.error_code(), Some(HANDLER_PANICKED));
        assert!(resp.error.unwrap().message.contains("kaboom"));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_exactly_one_response() {
        let mut d = CommandDispatcher::new().with_timeout(Duration::from_millis(100));
        d.register("scene", "slow", SlowHandler(Duration::from_millis(300)));
        let resp = d.dispatch(&sid(), req("s1", "scene", "slow")).await;
        assert_eq!(resp.error_code(), Some(COMMAND_TIMEOUT));
        assert_eq!(resp.id, "s1");
        assert_eq!(d.pending_count(), 0);

        // Let the handler finish; its result has nowhere to go.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_handler_beats_timeout() {
        let mut d = CommandDispatcher::new().with_timeout(Duration::from_millis(100));
        d.register("scene", "slow", SlowHandler(Duration::from_millis(50)));
        let resp = d.dispatch(&sid(), req("s1", "scene", "slow")).await;
        assert!(resp.success);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_in_flight_id_is_refused() {
        let mut d = CommandDispatcher::new().with_timeout(Duration::from_secs(1));
        d.register("scene", "slow", SlowHandler(Duration::from_millis(200)));
        let d = Arc::new(d);
        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(&sid(), req("dup", "scene", "slow")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(d.pending_count(), 1);
        let second = d.dispatch(&sid(), req("dup", "scene", "slow")).await;
        assert_eq!(second.error_code(), Some(DUPLICATE_REQUEST));
        assert!(first.await.unwrap().success);

        // Same id from a different session is independent.
        let other = d.dispatch(&SessionId::from("ses_other"), req("dup", "scene", "slow")).await;
        assert!(other.success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_session_fails_in_flight_requests() {
        let mut d = CommandDispatcher::new().with_timeout(Duration::from_secs(10));
        d.register("scene", "slow", SlowHandler(Duration::from_secs(5)));
        let d = Arc::new(d);
        let call = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(&sid(), req("c", "scene", "slow")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(d.cancel_session(&sid()), 1);
        let resp = call.await.unwrap();
        assert_eq!(resp.error_code(), Some(INTERNAL_ERROR));
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn commands_sorted_and_control_topic_reserved() {
        let mut d = CommandDispatcher::new();
        d.register("scene", "spawn", EchoHandler);
        d.register("perf", "report", EchoHandler);
        d.register(CONTROL_TOPIC, "hijack", EchoHandler);
        assert_eq!(d.commands(), vec!["perf.report", "scene.spawn"]);
        assert!(d.has_command("scene", "spawn"));
        assert!(!d.has_command(CONTROL_TOPIC, "hijack"));
    }

    #[tokio::test]
    async fn context_carries_request_identity() {
        let mut d = CommandDispatcher::new();
        d.register_fn("scene", "who", |_, ctx| async move {
            Ok::<_, CommandError>(json!({ "session": ctx.session_id.as_str(), "request": ctx.request_id }))
        });
        let resp = d.dispatch(&sid(), req("w1", "scene", "who")).await;
        let result = resp.result.unwrap();
        assert_eq!(result["session"], "ses_test");
        assert_eq!(result["request"], "w1");
    }
}
