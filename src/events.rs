//! Event stream: one [`SchedulerEvent`] per job or scheduler transition,
//! fanned out to every subscriber over its own bounded channel.
//!
//! Each subscriber gets a dedicated dispatcher task sitting between
//! `publish` and its `mpsc::Receiver`. `publish` never blocks on a slow
//! reader: it pushes into that subscriber's ring buffer and, if the buffer
//! is already at capacity, drops the *oldest* buffered event to make room.
//! The dispatcher task drains the buffer into the subscriber's channel one
//! event at a time, and reports a single [`SchedulerEvent::SinkLag`] the
//! first time a drop happens since the last successful forward.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::job::JobId;

/// Default bound on a subscriber's event buffer.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// A transition the scheduler reports to observers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Enqueued { job_id: JobId },
    Started { job_id: JobId },
    Completed { job_id: JobId },
    Failed { job_id: JobId, retryable: bool },
    Cancelled { job_id: JobId },
    Retrying { job_id: JobId, attempt: u32 },
    Backpressure { job_id: JobId },
    Paused,
    Resumed,
    /// Emitted once per lag episode for a subscriber whose buffer filled up
    /// and had to drop the oldest pending event.
    SinkLag,
}

/// Receiving half of a subscription, returned by
/// [`Broadcaster::subscribe`].
pub type EventSink = mpsc::Receiver<SchedulerEvent>;

struct RingBuffer {
    events: VecDeque<SchedulerEvent>,
    capacity: usize,
    lagging: bool,
}

struct Subscriber {
    buffer: parking_lot::Mutex<RingBuffer>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    fn push(&self, event: SchedulerEvent) {
        let mut buf = self.buffer.lock();
        if buf.events.len() >= buf.capacity {
            buf.events.pop_front();
            if !buf.lagging {
                tracing::warn!("event subscriber lagging, dropping oldest buffered event");
            }
            buf.lagging = true;
        }
        buf.events.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }
}

/// Fans a single stream of events out to any number of subscribers.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: parking_lot::Mutex<Vec<Arc<Subscriber>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with the default buffer capacity.
    pub fn subscribe(&self) -> EventSink {
        self.subscribe_with_capacity(DEFAULT_SINK_CAPACITY)
    }

    /// Register a new subscriber with an explicit buffer capacity, spawning
    /// its dedicated dispatcher task.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventSink {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let subscriber = Arc::new(Subscriber {
            buffer: parking_lot::Mutex::new(RingBuffer {
                events: VecDeque::with_capacity(capacity),
                capacity,
                lagging: false,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().push(subscriber.clone());
        tokio::spawn(dispatch_loop(subscriber, tx));
        rx
    }

    /// Publish an event to every live subscriber's buffer.
    pub fn publish(&self, event: SchedulerEvent) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut guard = self.subscribers.lock();
            guard.retain(|s| !s.closed.load(Ordering::Acquire));
            guard.clone()
        };
        for sub in subscribers {
            sub.push(event.clone());
        }
    }
}

/// Drains one subscriber's ring buffer into its channel, forever. Exits
/// once the subscriber's receiver is dropped.
async fn dispatch_loop(subscriber: Arc<Subscriber>, tx: mpsc::Sender<SchedulerEvent>) {
    loop {
        let (event, lagged) = {
            let mut buf = subscriber.buffer.lock();
            let event = buf.events.pop_front();
            let lagged = if event.is_some() { std::mem::take(&mut buf.lagging) } else { false };
            (event, lagged)
        };
        let Some(event) = event else {
            subscriber.notify.notified().await;
            continue;
        };
        if tx.send(event).await.is_err() {
            subscriber.closed.store(true, Ordering::Release);
            return;
        }
        if lagged {
            let _ = tx.try_send(SchedulerEvent::SinkLag);
        }
    }
}
