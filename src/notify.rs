use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-candidate lifecycle events. This is the seam
/// where the external notifier (email/Teams bridge) attaches; sends are
/// fire-and-forget and never fail or block the committing operation.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new() }
    }

    /// Subscribe to events about one candidate. Creates the channel if
    /// needed.
    pub fn subscribe(&self, candidate_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(candidate_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an event to its candidate's channel. No-op when the event
    /// has no candidate or nobody is listening.
    pub fn send(&self, event: &Event) {
        if let Some(candidate_id) = event.candidate_id()
            && let Some(sender) = self.channels.get(&candidate_id) {
                let _ = sender.send(event.clone());
            }
    }

    pub fn remove(&self, candidate_id: &Ulid) {
        self.channels.remove(candidate_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CandidateStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);

        let event = Event::CandidateStatusChanged {
            id: cid,
            status: CandidateStatus::Withdrawn,
            reason: Some("never booked".into()),
        };
        hub.send(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::CandidateStatusChanged {
            id: Ulid::new(),
            status: CandidateStatus::Rejected,
            reason: None,
        });
    }

    #[tokio::test]
    async fn events_without_candidate_go_nowhere() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);

        hub.send(&Event::LinkExpired { id: Ulid::new() });
        assert!(rx.try_recv().is_err());
    }
}
