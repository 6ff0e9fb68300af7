//! Admission Controller (§4.2).
//!
//! Runs as a periodic tick, also invoked immediately after any event that
//! may open capacity. This is the crate's sole authoritative starter — the
//! Priority Queue's own state changes never start a work order on their
//! own, resolving the double-starter hazard the design notes call out.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::HostProbe;
use crate::model::WorkOrderId;
use crate::queue::PriorityQueue;

#[derive(Debug, Clone)]
pub enum AdmissionEvent {
    AutoProcessStart(WorkOrderId),
    AutoProcessStaggerSkip { elapsed_ms: u64, delay_ms: u64 },
    AutoProcessMemorySkip { available_mb: u64, required_mb: u64 },
}

pub type AdmissionEventSink = Arc<dyn Fn(AdmissionEvent) + Send + Sync>;

/// The owner-supplied "start this work order" capability (§4.2 step 7).
pub type Starter =
    Arc<dyn Fn(WorkOrderId) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub stagger_delay_ms: u64,
    pub min_available_memory_mb: u64,
    pub tick_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            stagger_delay_ms: 0,
            min_available_memory_mb: 0,
            tick_interval: Duration::from_secs(5),
        }
    }
}

pub struct AdmissionController {
    queue: Arc<PriorityQueue>,
    host_probe: Arc<dyn HostProbe>,
    starter: Starter,
    config: AdmissionConfig,
    event_sink: Option<AdmissionEventSink>,

    tick_in_flight: AtomicBool,
    shutting_down: AtomicBool,
    /// Milliseconds since the Unix epoch of the last successful start, or
    /// -1 if no start has happened yet.
    last_start_time_ms: AtomicI64,
}

impl AdmissionController {
    pub fn new(
        queue: Arc<PriorityQueue>,
        host_probe: Arc<dyn HostProbe>,
        starter: Starter,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            queue,
            host_probe,
            starter,
            config,
            event_sink: None,
            tick_in_flight: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            last_start_time_ms: AtomicI64::new(-1),
        }
    }

    pub fn with_event_sink(mut self, sink: AdmissionEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    fn emit(&self, event: AdmissionEvent) {
        if let Some(sink) = &self.event_sink {
            sink(event);
        }
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Run one admission tick (§4.2 steps 1-7).
    pub async fn tick(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self
            .tick_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.tick_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) {
        if !self.queue.has_capacity() {
            return;
        }
        if self.queue.waiting_len() == 0 {
            return;
        }

        // Stagger gate.
        let last_start = self.last_start_time_ms.load(Ordering::SeqCst);
        if last_start >= 0 {
            let now_ms = now_millis();
            let elapsed = (now_ms - last_start).max(0) as u64;
            if elapsed < self.config.stagger_delay_ms {
                self.emit(AdmissionEvent::AutoProcessStaggerSkip {
                    elapsed_ms: elapsed,
                    delay_ms: self.config.stagger_delay_ms,
                });
                return;
            }
        }

        // Memory gate.
        let available_mb = self.host_probe.free_memory_mb().await;
        if available_mb < self.config.min_available_memory_mb {
            self.emit(AdmissionEvent::AutoProcessMemorySkip {
                available_mb,
                required_mb: self.config.min_available_memory_mb,
            });
            return;
        }

        // Timeout-sweep the head.
        self.queue.evict_timed_out_head();

        let Some(id) = self.queue.peek() else {
            return;
        };

        // Update lastStartTime before invoking the starter so overlapping
        // ticks observe the same gate (§4.2 step 7).
        self.last_start_time_ms.store(now_millis(), Ordering::SeqCst);
        self.emit(AdmissionEvent::AutoProcessStart(id));

        if let Err(e) = (self.starter)(id).await {
            warn!(work_order_id = %id, error = %e, "starter failed; work order remains queued");
        } else {
            debug!(work_order_id = %id, "admission started work order");
        }
    }

    /// Spawn a background task that ticks on `config.tick_interval` until
    /// `shutdown` is called. `self` must be wrapped in an `Arc`.
    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.tick_interval);
            loop {
                interval.tick().await;
                if self.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                self.tick().await;
            }
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
