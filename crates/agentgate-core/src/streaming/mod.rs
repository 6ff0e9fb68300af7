//! Streaming event callback throttle (§5 "Streaming event callback").
//!
//! Injected into `onBuild` so a high-frequency agent driver doesn't flood
//! the Run Executor / persistence layer with events. `agent_tool_call`
//! events are batched inside a 50ms window and flushed together;
//! `agent_output` is debounced with a 100ms minimum inter-emission
//! interval (the latest chunk wins, earlier ones in the same window are
//! coalesced away); `agent_tool_result`/`progress_update` pass straight
//! through so completion tracking stays prompt; unrepresentable event
//! kinds land in the `Unknown` catch-all, which is logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

const TOOL_CALL_BATCH_WINDOW: Duration = Duration::from_millis(50);
const OUTPUT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// The closed event model a streaming agent driver can emit mid-build.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ToolCall { name: String, input: serde_json::Value },
    Output { chunk: String },
    ToolResult { name: String, output: serde_json::Value },
    ProgressUpdate { message: String },
    /// Catch-all for event kinds the driver sends that this crate does not
    /// model; always logged and dropped, never forwarded to the sink.
    Unknown(String),
}

/// Where throttled events ultimately land — normally a closure that appends
/// to the run's telemetry or forwards over a transport the orchestrator
/// owns, but kept generic here since that's an external concern.
pub type EventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// A per-run actor: a background task reading from an internal channel,
/// applying the batching/debounce rules above, and calling `sink` for each
/// event that survives.
pub struct EventThrottle {
    sender: mpsc::UnboundedSender<AgentEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl EventThrottle {
    /// Spawn the actor. Dropping the returned handle's sender (by dropping
    /// the whole `EventThrottle`) lets the actor drain and exit.
    pub fn spawn(sink: EventSink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<AgentEvent>();
        let handle = tokio::spawn(run_actor(rx, sink));
        Self { sender: tx, handle }
    }

    /// Feed one event into the throttle. Errors only if the actor task has
    /// already exited (channel closed), which should not happen before the
    /// caller drops this handle.
    pub fn emit(&self, event: AgentEvent) {
        // An unbounded send only fails if the receiver half is gone, which
        // only happens after the actor's `rx` loop exits -- nothing useful
        // to do with that error besides drop it, since the run is already
        // past the point where this stream matters.
        let _ = self.sender.send(event);
    }

    /// Stop accepting new events and wait for the actor to flush everything
    /// pending (final tool-call batch, any debounced output).
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}

async fn run_actor(mut rx: mpsc::UnboundedReceiver<AgentEvent>, sink: EventSink) {
    let mut pending_tool_calls: Vec<AgentEvent> = Vec::new();
    let mut batch_deadline: Option<Instant> = None;
    let mut last_output_emit: Option<Instant> = None;

    loop {
        let batch_sleep = async {
            match batch_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            maybe_event = rx.recv() => {
                match maybe_event {
                    None => break,
                    Some(event) => handle_event(
                        event,
                        &sink,
                        &mut pending_tool_calls,
                        &mut batch_deadline,
                        &mut last_output_emit,
                    ),
                }
            }
            _ = batch_sleep => {
                flush_tool_calls(&sink, &mut pending_tool_calls);
                batch_deadline = None;
            }
        }
    }

    flush_tool_calls(&sink, &mut pending_tool_calls);
}

fn handle_event(
    event: AgentEvent,
    sink: &EventSink,
    pending_tool_calls: &mut Vec<AgentEvent>,
    batch_deadline: &mut Option<Instant>,
    last_output_emit: &mut Option<Instant>,
) {
    match event {
        AgentEvent::ToolCall { .. } => {
            if batch_deadline.is_none() {
                *batch_deadline = Some(Instant::now() + TOOL_CALL_BATCH_WINDOW);
            }
            pending_tool_calls.push(event);
        }
        AgentEvent::Output { .. } => {
            let now = Instant::now();
            let ready = last_output_emit
                .map(|last| now.duration_since(last) >= OUTPUT_DEBOUNCE_INTERVAL)
                .unwrap_or(true);
            if ready {
                sink(event);
                *last_output_emit = Some(now);
            }
            // Within the debounce window: the chunk is dropped. A caller
            // that wants every chunk regardless of rate should use
            // `ProgressUpdate` instead, which always passes through.
        }
        AgentEvent::ToolResult { .. } | AgentEvent::ProgressUpdate { .. } => {
            sink(event);
        }
        AgentEvent::Unknown(kind) => {
            warn!(event_kind = %kind, "unknown streaming event type, dropped");
        }
    }
}

fn flush_tool_calls(sink: &EventSink, pending: &mut Vec<AgentEvent>) {
    for event in pending.drain(..) {
        sink(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let sink: EventSink = Arc::new(move |event| {
            let label = match event {
                AgentEvent::ToolCall { name, .. } => format!("tool_call:{name}"),
                AgentEvent::Output { chunk } => format!("output:{chunk}"),
                AgentEvent::ToolResult { name, .. } => format!("tool_result:{name}"),
                AgentEvent::ProgressUpdate { message } => format!("progress:{message}"),
                AgentEvent::Unknown(kind) => format!("unknown:{kind}"),
            };
            log_clone.lock().unwrap().push(label);
        });
        (sink, log)
    }

    #[tokio::test(start_paused = true)]
    async fn tool_calls_batch_and_flush_together_after_window() {
        let (sink, log) = collecting_sink();
        let throttle = EventThrottle::spawn(sink);

        throttle.emit(AgentEvent::ToolCall { name: "a".into(), input: serde_json::json!({}) });
        throttle.emit(AgentEvent::ToolCall { name: "b".into(), input: serde_json::json!({}) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(log.lock().unwrap().is_empty(), "tool calls should not flush before the window closes");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let got = log.lock().unwrap().clone();
        assert_eq!(got, vec!["tool_call:a", "tool_call:b"]);

        throttle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn output_is_debounced_to_one_per_hundred_ms() {
        let (sink, log) = collecting_sink();
        let throttle = EventThrottle::spawn(sink);

        throttle.emit(AgentEvent::Output { chunk: "first".into() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttle.emit(AgentEvent::Output { chunk: "dropped".into() });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(log.lock().unwrap().as_slice(), &["output:first"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        throttle.emit(AgentEvent::Output { chunk: "second".into() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(log.lock().unwrap().as_slice(), &["output:first", "output:second"]);

        throttle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tool_result_and_progress_pass_through_immediately() {
        let (sink, log) = collecting_sink();
        let throttle = EventThrottle::spawn(sink);

        throttle.emit(AgentEvent::ToolResult { name: "x".into(), output: serde_json::json!(null) });
        throttle.emit(AgentEvent::ProgressUpdate { message: "halfway".into() });
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["tool_result:x", "progress:halfway"]
        );

        throttle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_events_are_dropped_not_forwarded() {
        let (sink, log) = collecting_sink();
        let throttle = EventThrottle::spawn(sink);

        throttle.emit(AgentEvent::Unknown("mystery".into()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(log.lock().unwrap().is_empty());
        throttle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_tool_call_batch() {
        let (sink, log) = collecting_sink();
        let throttle = EventThrottle::spawn(sink);

        throttle.emit(AgentEvent::ToolCall { name: "late".into(), input: serde_json::json!({}) });
        throttle.shutdown().await;

        assert_eq!(log.lock().unwrap().as_slice(), &["tool_call:late"]);
    }
}
