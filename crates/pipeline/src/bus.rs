//! Session event bus
//!
//! Playback feeds back into ingress for interruption attribution. The edge
//! is carried by this bus instead of back-pointers: ingress owns the
//! buffer, playback owns the speaking bit, the bus carries the signal.

use tokio::sync::broadcast;

/// Signals crossing component boundaries within one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Inbound energy crossed threshold while the assistant was speaking
    Interruption {
        energy_db: f32,
        played_until_ms: u64,
    },
    /// The turn controller requests an explicit segment flush
    FlushSegment,
    /// The telephony bridge closed the stream
    BridgeClosed,
    /// DTMF digit received from the bridge
    Dtmf(char),
}

/// Broadcast bus shared by the session's components
#[derive(Debug, Clone)]
pub struct SessionBus {
    tx: broadcast::Sender<SessionSignal>,
}

impl SessionBus {
    pub fn new() -> Self {
        // Capacity sized to survive a slow subscriber during a burst
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.tx.subscribe()
    }

    /// Publish a signal; lagging subscribers miss it rather than block
    pub fn publish(&self, signal: SessionSignal) {
        let _ = self.tx.send(signal);
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = SessionBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionSignal::Dtmf('3'));
        assert_eq!(rx.recv().await.unwrap(), SessionSignal::Dtmf('3'));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = SessionBus::new();
        bus.publish(SessionSignal::BridgeClosed);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = SessionBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(SessionSignal::FlushSegment);
        assert_eq!(a.recv().await.unwrap(), SessionSignal::FlushSegment);
        assert_eq!(b.recv().await.unwrap(), SessionSignal::FlushSegment);
    }
}
