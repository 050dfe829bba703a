//! Interrupt/callback adapter.
//!
//! Bridges hardware edges to user code through a bounded event channel, so
//! the thread that detects an edge never runs user logic.
//!
//! # Architecture
//!
//! ```text
//!   platform edge watcher                     InterruptLine
//!   (poll thread / SimPlatform)  ┌───────────────────────────────────┐
//!            │                   │  slot: at most one consumer       │
//!            ▼                   │                                   │
//!       EdgeSink::deliver ──────▶│  bounded mpsc (Block | DropNewest)│
//!                                └───────┬──────────────────┬────────┘
//!                                        │                  │
//!                              dispatcher thread      subscribe() receiver
//!                              EdgeHandler::on_edge   (caller consumes)
//! ```
//!
//! Registering a consumer replaces the previous one. The replacement is
//! reported in the returned [`Registration`], logged at `warn` and counted.
//! Events already queued for the old consumer still reach it; edges after
//! the replacement reach only the new one.
//!
//! A handler that returns `Err` or panics is a callback fault: it is logged,
//! counted, forwarded to the fault sink if one is set, and the handler stays
//! armed.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sensorbus_hal::interrupt::{EdgeEvent, EdgeKind, InterruptConfig, InterruptLine};
//!
//! let line = InterruptLine::new("gpio3", 3, InterruptConfig::default());
//! let count = Arc::new(AtomicU64::new(0));
//! let c = Arc::clone(&count);
//! line.install_handler(move |_event: &EdgeEvent| -> sensorbus_core::Result<()> {
//!     c.fetch_add(1, Ordering::SeqCst);
//!     Ok(())
//! })?;
//!
//! let sink = line.sink();
//! for _ in 0..3 {
//!     sink.deliver(EdgeKind::Rising, true);
//! }
//! assert!(line.wait_idle(Duration::from_secs(1)));
//! assert_eq!(count.load(Ordering::SeqCst), 3);
//! # Ok::<(), sensorbus_core::SensorError>(())
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sensorbus_core::{Result, SensorError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Default capacity of a line's event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Upper bound on a single wait for queue space or dispatcher progress.
const PROGRESS_POLL: Duration = Duration::from_millis(5);

/// Direction of a detected transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Low to high
    Rising,
    /// High to low
    Falling,
}

impl EdgeKind {
    /// Edge kind for a transition ending at `level`.
    pub fn from_level(level: bool) -> Self {
        if level {
            EdgeKind::Rising
        } else {
            EdgeKind::Falling
        }
    }
}

/// One qualifying edge.
#[derive(Debug, Clone)]
pub struct EdgeEvent {
    /// Line name (e.g. `gpio3`)
    pub line: String,
    /// Pin number
    pub pin: u32,
    /// Transition direction
    pub kind: EdgeKind,
    /// Logical level after the transition
    pub level: bool,
    /// Per-line sequence number, starting at 1, in occurrence order
    pub sequence: u64,
    /// When the edge was delivered
    pub timestamp: Instant,
}

/// User logic run for each edge.
///
/// Closures `FnMut(&EdgeEvent) -> Result<()>` implement this trait.
pub trait EdgeHandler: Send + 'static {
    /// Handle one edge. Errors are reported as callback faults.
    fn on_edge(&mut self, event: &EdgeEvent) -> Result<()>;
}

impl<F> EdgeHandler for F
where
    F: FnMut(&EdgeEvent) -> Result<()> + Send + 'static,
{
    fn on_edge(&mut self, event: &EdgeEvent) -> Result<()> {
        self(event)
    }
}

/// What the producer does when a consumer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space. Every edge is delivered exactly once.
    #[default]
    Block,
    /// Drop the new edge and count it. The producer never waits.
    DropNewest,
}

/// Queue configuration for an interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Identifier of a registered consumer, unique per line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// The new consumer
    pub id: HandlerId,
    /// The consumer it replaced, if any
    pub replaced: Option<HandlerId>,
}

/// A handler failure reported to the fault sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFault {
    pub line: String,
    pub handler: HandlerId,
    pub sequence: u64,
    pub message: String,
}

impl From<CallbackFault> for SensorError {
    fn from(fault: CallbackFault) -> Self {
        SensorError::CallbackFault {
            line: fault.line,
            handler: fault.handler.0,
            message: fault.message,
        }
    }
}

/// Snapshot of a line's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptStats {
    /// Edges accepted into a consumer queue
    pub delivered: u64,
    /// Handler invocations completed (including faulted ones)
    pub dispatched: u64,
    /// Edges that arrived with no consumer armed
    pub dropped_unarmed: u64,
    /// Edges dropped because the queue was full (`DropNewest`)
    pub dropped_overflow: u64,
    /// Handler errors and panics
    pub faults: u64,
    /// Registrations that replaced an armed consumer
    pub replacements: u64,
    /// Last sequence number handed out
    pub sequence: u64,
    /// Whether a consumer is armed
    pub armed: bool,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    dispatched: AtomicU64,
    dropped_unarmed: AtomicU64,
    dropped_overflow: AtomicU64,
    faults: AtomicU64,
    replacements: AtomicU64,
    sequence: AtomicU64,
    /// Events queued for a dispatcher and not yet handled
    pending: AtomicU64,
}

struct Consumer {
    id: HandlerId,
    sender: mpsc::Sender<EdgeEvent>,
    dispatcher: Option<JoinHandle<()>>,
}

struct Shared {
    name: String,
    pin: u32,
    config: InterruptConfig,
    slot: Mutex<Option<Consumer>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    fault_sink: Mutex<Option<mpsc::Sender<CallbackFault>>>,
    counters: Counters,
    next_id: AtomicU64,
    /// Serializes producers so sequence order equals queue order
    send_lock: Mutex<()>,
    progress_lock: Mutex<()>,
    progress: Condvar,
}

impl Shared {
    /// Armed consumer's id, a sender clone, and whether it has a dispatcher.
    fn target(&self) -> Option<(HandlerId, mpsc::Sender<EdgeEvent>, bool)> {
        self.slot
            .lock()
            .as_ref()
            .map(|c| (c.id, c.sender.clone(), c.dispatcher.is_some()))
    }

    fn notify_progress(&self) {
        let _guard = self.progress_lock.lock();
        self.progress.notify_all();
    }

    fn is_idle(&self) -> bool {
        if self.counters.pending.load(Ordering::SeqCst) != 0 {
            return false;
        }
        match self.slot.lock().as_ref() {
            // Subscriber queues count as idle once the caller has drained them
            Some(c) if c.dispatcher.is_none() => c.sender.capacity() == c.sender.max_capacity(),
            _ => true,
        }
    }

    fn report_fault(&self, handler: HandlerId, sequence: u64, message: String) {
        self.counters.faults.fetch_add(1, Ordering::SeqCst);
        error!(
            line = %self.name,
            handler = %handler,
            sequence,
            error = %message,
            "Interrupt handler faulted"
        );

        let sink = self.fault_sink.lock().clone();
        if let Some(sink) = sink {
            let fault = CallbackFault {
                line: self.name.clone(),
                handler,
                sequence,
                message,
            };
            if let Err(e) = sink.try_send(fault) {
                debug!(line = %self.name, "Fault sink unavailable: {}", e);
            }
        }
    }
}

/// Producer half of an interrupt line, handed to the platform's edge
/// watcher.
#[derive(Clone)]
pub struct EdgeSink {
    shared: Arc<Shared>,
}

impl EdgeSink {
    /// Deliver one qualifying edge.
    ///
    /// Returns `true` if the edge was queued for a consumer. Under
    /// [`OverflowPolicy::Block`] a waiting edge goes to whichever consumer
    /// is armed when room appears, and is dropped if the line is disarmed.
    pub fn deliver(&self, kind: EdgeKind, level: bool) -> bool {
        let shared = &self.shared;
        let _order = shared.send_lock.lock();

        let Some((mut id, mut sender, mut dispatched)) = shared.target() else {
            shared.counters.dropped_unarmed.fetch_add(1, Ordering::SeqCst);
            trace!(line = %shared.name, "Edge on unarmed line dropped");
            return false;
        };

        let sequence = shared.counters.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut event = EdgeEvent {
            line: shared.name.clone(),
            pin: shared.pin,
            kind,
            level,
            sequence,
            timestamp: Instant::now(),
        };

        loop {
            // Counted before the send so the dispatcher never sees it negative
            if dispatched {
                shared.counters.pending.fetch_add(1, Ordering::SeqCst);
            }
            let outcome = sender.try_send(event);
            if outcome.is_err() && dispatched {
                shared.counters.pending.fetch_sub(1, Ordering::SeqCst);
            }

            match outcome {
                Ok(()) => {
                    shared.counters.delivered.fetch_add(1, Ordering::SeqCst);
                    trace!(line = %shared.name, handler = %id, sequence, "Edge queued");
                    return true;
                }
                Err(mpsc::error::TrySendError::Full(back)) => match shared.config.overflow {
                    OverflowPolicy::DropNewest => {
                        shared.counters.dropped_overflow.fetch_add(1, Ordering::SeqCst);
                        trace!(line = %shared.name, sequence, "Queue full, edge dropped");
                        return false;
                    }
                    OverflowPolicy::Block => {
                        event = back;
                        {
                            let mut guard = shared.progress_lock.lock();
                            shared.progress.wait_for(&mut guard, PROGRESS_POLL);
                        }

                        // The consumer may have been replaced or disarmed while we waited
                        match shared.target() {
                            None => {
                                shared.counters.dropped_unarmed.fetch_add(1, Ordering::SeqCst);
                                debug!(line = %shared.name, sequence, "Line disarmed, edge dropped");
                                return false;
                            }
                            Some((current, next, has_dispatcher)) if current != id => {
                                debug!(
                                    line = %shared.name,
                                    from = %id,
                                    to = %current,
                                    sequence,
                                    "Blocked edge redirected to new handler"
                                );
                                id = current;
                                sender = next;
                                dispatched = has_dispatcher;
                            }
                            Some(_) => {}
                        }
                    }
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    shared.counters.dropped_unarmed.fetch_add(1, Ordering::SeqCst);
                    debug!(line = %shared.name, handler = %id, "Consumer closed, edge dropped");
                    return false;
                }
            }
        }
    }

    /// Name of the line this sink feeds.
    pub fn line(&self) -> &str {
        &self.shared.name
    }
}

/// Receiving end returned by [`InterruptLine::subscribe`].
pub struct EdgeSubscription {
    pub registration: Registration,
    pub events: mpsc::Receiver<EdgeEvent>,
}

/// One interrupt source with at most one armed consumer.
///
/// Dropping the line disarms it and joins its dispatchers after they drain.
pub struct InterruptLine {
    shared: Arc<Shared>,
}

impl InterruptLine {
    /// Create an unarmed line.
    pub fn new(name: impl Into<String>, pin: u32, config: InterruptConfig) -> Self {
        let config = InterruptConfig {
            queue_capacity: config.queue_capacity.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                pin,
                config,
                slot: Mutex::new(None),
                retired: Mutex::new(Vec::new()),
                fault_sink: Mutex::new(None),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
                send_lock: Mutex::new(()),
                progress_lock: Mutex::new(()),
                progress: Condvar::new(),
            }),
        }
    }

    /// Line name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue configuration.
    pub fn config(&self) -> InterruptConfig {
        self.shared.config
    }

    /// Producer handle for the platform.
    pub fn sink(&self) -> EdgeSink {
        EdgeSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Arm `handler` on a dedicated dispatcher thread.
    ///
    /// Replaces any armed consumer.
    pub fn install_handler<H: EdgeHandler>(&self, handler: H) -> Result<Registration> {
        let id = self.next_id();
        let (sender, receiver) = mpsc::channel(self.shared.config.queue_capacity);
        let dispatcher = spawn_dispatcher(Arc::clone(&self.shared), id, receiver, handler)?;
        Ok(self.arm(Consumer {
            id,
            sender,
            dispatcher: Some(dispatcher),
        }))
    }

    /// Arm a receiver the caller drains itself.
    ///
    /// Replaces any armed consumer.
    pub fn subscribe(&self) -> EdgeSubscription {
        let id = self.next_id();
        let (sender, events) = mpsc::channel(self.shared.config.queue_capacity);
        let registration = self.arm(Consumer {
            id,
            sender,
            dispatcher: None,
        });
        EdgeSubscription {
            registration,
            events,
        }
    }

    /// Disarm the line.
    ///
    /// Queued events are still dispatched; this returns after every
    /// dispatcher of this line has drained and exited. Returns the consumer
    /// that was armed.
    pub fn disarm(&self) -> Option<HandlerId> {
        let consumer = self.shared.slot.lock().take();
        let id = consumer.as_ref().map(|c| c.id);

        if let Some(Consumer {
            sender, dispatcher, ..
        }) = consumer
        {
            drop(sender);
            if let Some(handle) = dispatcher {
                self.shared.retired.lock().push(handle);
            }
        }

        self.shared.notify_progress();
        self.join_retired();

        if let Some(id) = id {
            info!(line = %self.shared.name, handler = %id, "Interrupt line disarmed");
        }
        id
    }

    /// Whether a consumer is armed.
    pub fn is_armed(&self) -> bool {
        self.shared.slot.lock().is_some()
    }

    /// Currently armed consumer.
    pub fn current(&self) -> Option<HandlerId> {
        self.shared.slot.lock().as_ref().map(|c| c.id)
    }

    /// Forward callback faults to `sink`.
    ///
    /// A full or closed sink loses the fault report, never the handler.
    pub fn set_fault_sink(&self, sink: mpsc::Sender<CallbackFault>) {
        *self.shared.fault_sink.lock() = Some(sink);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> InterruptStats {
        let c = &self.shared.counters;
        InterruptStats {
            delivered: c.delivered.load(Ordering::SeqCst),
            dispatched: c.dispatched.load(Ordering::SeqCst),
            dropped_unarmed: c.dropped_unarmed.load(Ordering::SeqCst),
            dropped_overflow: c.dropped_overflow.load(Ordering::SeqCst),
            faults: c.faults.load(Ordering::SeqCst),
            replacements: c.replacements.load(Ordering::SeqCst),
            sequence: c.sequence.load(Ordering::SeqCst),
            armed: self.is_armed(),
        }
    }

    /// Block until every queued event has been handled, or `timeout`
    /// elapses. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.progress_lock.lock();
        loop {
            if self.shared.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared
                .progress
                .wait_for(&mut guard, (deadline - now).min(PROGRESS_POLL));
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.shared.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn arm(&self, consumer: Consumer) -> Registration {
        let id = consumer.id;
        let previous = self.shared.slot.lock().replace(consumer);
        self.shared.notify_progress();

        let replaced = previous.map(|old| {
            let old_id = old.id;
            // Dropping the sender lets the old dispatcher drain and exit
            if let Some(handle) = old.dispatcher {
                self.shared.retired.lock().push(handle);
            }
            old_id
        });

        match replaced {
            Some(old) => {
                self.shared.counters.replacements.fetch_add(1, Ordering::SeqCst);
                warn!(
                    line = %self.shared.name,
                    replaced = %old,
                    handler = %id,
                    "Replacing interrupt handler"
                );
            }
            None => info!(line = %self.shared.name, handler = %id, "Interrupt line armed"),
        }

        Registration { id, replaced }
    }

    fn join_retired(&self) {
        let handles: Vec<_> = self.shared.retired.lock().drain(..).collect();
        for handle in handles {
            // A handler that disarms its own line cannot join itself
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!(line = %self.shared.name, "Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for InterruptLine {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptLine")
            .field("name", &self.shared.name)
            .field("pin", &self.shared.pin)
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn spawn_dispatcher<H: EdgeHandler>(
    shared: Arc<Shared>,
    id: HandlerId,
    mut receiver: mpsc::Receiver<EdgeEvent>,
    mut handler: H,
) -> Result<JoinHandle<()>> {
    let name = format!("irq-{}", shared.name);
    let label = format!("dispatcher for {}", shared.name);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            debug!(line = %shared.name, handler = %id, "Dispatcher started");
            while let Some(event) = receiver.blocking_recv() {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_edge(&event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => shared.report_fault(id, event.sequence, e.to_string()),
                    Err(payload) => {
                        shared.report_fault(id, event.sequence, panic_message(payload.as_ref()))
                    }
                }
                shared.counters.dispatched.fetch_add(1, Ordering::SeqCst);
                shared.counters.pending.fetch_sub(1, Ordering::SeqCst);
                shared.notify_progress();
            }
            debug!(line = %shared.name, handler = %id, "Dispatcher exiting");
        })
        .map_err(|e| SensorError::from_io(label, &e))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unarmed_edges_are_counted() {
        let line = InterruptLine::new("gpio1", 1, InterruptConfig::default());
        assert!(!line.sink().deliver(EdgeKind::Rising, true));
        let stats = line.stats();
        assert_eq!(stats.dropped_unarmed, 1);
        assert_eq!(stats.delivered, 0);
        assert!(!stats.armed);
    }

    #[test]
    fn test_handler_ids_increase() {
        let line = InterruptLine::new("gpio2", 2, InterruptConfig::default());
        let first = line.install_handler(|_: &EdgeEvent| -> Result<()> { Ok(()) }).unwrap();
        let second = line.subscribe().registration;
        assert!(second.id > first.id);
        assert_eq!(second.replaced, Some(first.id));
        assert_eq!(line.current(), Some(second.id));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_replacement_is_logged() {
        let line = InterruptLine::new("gpio3", 3, InterruptConfig::default());
        line.subscribe();
        assert!(!logs_contain("Replacing interrupt handler"));
        let reg = line.subscribe().registration;
        assert!(reg.replaced.is_some());
        assert!(logs_contain("Replacing interrupt handler"));
        assert_eq!(line.stats().replacements, 1);
    }

    #[test]
    fn test_fault_keeps_handler_armed() {
        let line = InterruptLine::new("gpio6", 6, InterruptConfig::default());
        line.install_handler(|_: &EdgeEvent| -> Result<()> {
            Err(SensorError::transient("relay", "busy"))
        })
        .unwrap();
        line.sink().deliver(EdgeKind::Rising, true);
        assert!(line.wait_idle(Duration::from_secs(5)));
        assert_eq!(line.stats().faults, 1);
        assert!(line.is_armed());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let line = InterruptLine::new(
            "gpio4",
            4,
            InterruptConfig {
                queue_capacity: 0,
                overflow: OverflowPolicy::DropNewest,
            },
        );
        assert_eq!(line.config().queue_capacity, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "handler panicked");
    }

    #[test]
    fn test_subscriber_idle_after_drain() {
        let line = InterruptLine::new("gpio5", 5, InterruptConfig::default());
        let mut sub = line.subscribe();
        line.sink().deliver(EdgeKind::Falling, false);
        assert!(!line.wait_idle(Duration::from_millis(20)));
        let event = sub.events.try_recv().unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.kind, EdgeKind::Falling);
        assert!(line.wait_idle(Duration::from_millis(20)));
    }
}
