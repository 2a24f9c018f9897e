use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lamina_common::events::SlideEvent;

/// Per-subscriber buffer. A subscriber that falls this far behind is
/// disconnected rather than allowed to block producers.
const SUBSCRIBER_BUFFER: usize = 256;

/// Inbox shared by all producers.
const BUS_BUFFER: usize = 1024;

/// Closed subscribers are pruned on this cadence even when no events flow.
const HEARTBEAT: Duration = Duration::from_secs(10);

/// A live subscription to the event stream.
pub struct Subscription {
    pub id: u64,
    pub events: async_channel::Receiver<SlideEvent>,
}

enum BusMsg {
    Publish(SlideEvent),
    Subscribe { reply: oneshot::Sender<Subscription> },
}

/// Producer-side handle to the event bus. Publishing never blocks; events
/// for a single base name reach every subscriber in production order
/// because a single task serialises all writes.
#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<BusMsg>,
}

impl BusHandle {
    pub fn publish(&self, event: SlideEvent) {
        if self.tx.try_send(BusMsg::Publish(event)).is_err() {
            tracing::warn!("event bus inbox unavailable, dropping event");
        }
    }

    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BusMsg::Subscribe { reply })
            .await
            .map_err(|_| anyhow::anyhow!("event bus is not running"))?;
        rx.await.context("event bus dropped subscribe request")
    }
}

struct Subscriber {
    id: u64,
    tx: async_channel::Sender<SlideEvent>,
}

#[derive(Default)]
struct BusState {
    subscribers: Vec<Subscriber>,
    next_id: u64,
    /// `started` (or `restored`) event per currently active base name,
    /// replayed to late subscribers.
    started: HashMap<String, SlideEvent>,
    /// Most recent progress event per active base name.
    last_progress: HashMap<String, SlideEvent>,
}

impl BusState {
    /// Maintain the catch-up snapshot from the event flow itself.
    fn track(&mut self, event: &SlideEvent) {
        match event {
            SlideEvent::Started { base_name } | SlideEvent::Restored { base_name } => {
                self.started.insert(base_name.clone(), event.clone());
                self.last_progress.remove(base_name);
            }
            SlideEvent::Progress { base_name, .. } => {
                self.last_progress.insert(base_name.clone(), event.clone());
            }
            SlideEvent::Complete { base_name }
            | SlideEvent::Cancelled { base_name }
            | SlideEvent::Failed { base_name, .. }
            | SlideEvent::Deleted { base_name } => {
                self.started.remove(base_name);
                self.last_progress.remove(base_name);
            }
            _ => {}
        }
    }

    fn publish(&mut self, event: SlideEvent) {
        self.track(&event);
        self.subscribers.retain(|sub| {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(async_channel::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = sub.id, "disconnecting slow subscriber");
                    false
                }
                Err(async_channel::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn subscribe(&mut self, reply: oneshot::Sender<Subscription>) {
        let (tx, rx) = async_channel::bounded(SUBSCRIBER_BUFFER);

        // Catch-up burst: a started event for each active job, followed by
        // its last known progress.
        for (base, started) in &self.started {
            let _ = tx.try_send(started.clone());
            if let Some(progress) = self.last_progress.get(base) {
                let _ = tx.try_send(progress.clone());
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber { id, tx });
        let _ = reply.send(Subscription { id, events: rx });
    }

    fn prune_closed(&mut self) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
    }
}

/// Spawn the bus task. All producers share the returned handle.
pub fn spawn_bus(cancel: CancellationToken) -> (BusHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(BUS_BUFFER);
    let handle = BusHandle { tx };
    let task = tokio::spawn(async move {
        let mut state = BusState::default();
        let mut heartbeat = tokio::time::interval(HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = heartbeat.tick() => state.prune_closed(),
                msg = rx.recv() => match msg {
                    Some(BusMsg::Publish(event)) => state.publish(event),
                    Some(BusMsg::Subscribe { reply }) => state.subscribe(reply),
                    None => break,
                }
            }
        }
        tracing::debug!("event bus stopped");
    });
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_common::types::JobPhase;

    fn progress(base: &str, percent: u8) -> SlideEvent {
        SlideEvent::Progress {
            base_name: base.to_string(),
            phase: JobPhase::Dzi,
            percent,
        }
    }

    #[tokio::test]
    async fn test_per_base_ordering() {
        let cancel = CancellationToken::new();
        let (bus, _task) = spawn_bus(cancel.clone());
        let sub = bus.subscribe().await.unwrap();

        bus.publish(SlideEvent::Queued {
            base_name: "a".into(),
        });
        bus.publish(SlideEvent::Started {
            base_name: "a".into(),
        });
        bus.publish(progress("a", 10));
        bus.publish(progress("a", 60));
        bus.publish(SlideEvent::Complete {
            base_name: "a".into(),
        });

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(sub.events.recv().await.unwrap());
        }
        assert!(matches!(seen[0], SlideEvent::Queued { .. }));
        assert!(matches!(seen[1], SlideEvent::Started { .. }));
        assert!(matches!(seen[2], SlideEvent::Progress { percent: 10, .. }));
        assert!(matches!(seen[3], SlideEvent::Progress { percent: 60, .. }));
        assert!(matches!(seen[4], SlideEvent::Complete { .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_late_subscriber_catch_up() {
        let cancel = CancellationToken::new();
        let (bus, _task) = spawn_bus(cancel.clone());

        bus.publish(SlideEvent::Started {
            base_name: "a".into(),
        });
        bus.publish(progress("a", 42));
        // Give the bus task a chance to process before subscribing.
        tokio::task::yield_now().await;

        let sub = bus.subscribe().await.unwrap();
        let first = sub.events.recv().await.unwrap();
        let second = sub.events.recv().await.unwrap();
        assert_eq!(
            first,
            SlideEvent::Started {
                base_name: "a".into()
            }
        );
        assert_eq!(second, progress("a", 42));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected() {
        let cancel = CancellationToken::new();
        let (bus, _task) = spawn_bus(cancel.clone());
        let sub = bus.subscribe().await.unwrap();

        // Never drained: overflow the bounded buffer.
        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(progress("a", (i % 100) as u8));
            if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }
        tokio::task::yield_now().await;

        // The subscriber was dropped: its channel closes once drained.
        let mut received = 0usize;
        while sub.events.recv().await.is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_BUFFER);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_terminal_event_clears_catch_up() {
        let cancel = CancellationToken::new();
        let (bus, _task) = spawn_bus(cancel.clone());

        bus.publish(SlideEvent::Started {
            base_name: "a".into(),
        });
        bus.publish(progress("a", 50));
        bus.publish(SlideEvent::Complete {
            base_name: "a".into(),
        });
        tokio::task::yield_now().await;

        let sub = bus.subscribe().await.unwrap();
        // No catch-up burst for a finished job.
        assert!(sub.events.try_recv().is_err());
        cancel.cancel();
    }
}
