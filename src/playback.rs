use crate::Result;
use std::path::Path;
use tokio::sync::broadcast;

/// Notifications from the audio output.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started,
    Ended,
    /// The output stalled before or during playback.
    Delay { millis: f64 },
}

/// Fan-out of [`PlaybackEvent`]s for sink implementations.
#[derive(Debug, Clone)]
pub struct PlaybackEvents {
    tx: broadcast::Sender<PlaybackEvent>,
}

impl PlaybackEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends to every current subscriber. Having none is fine.
    pub fn emit(&self, event: PlaybackEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PlaybackEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

/// The audio output the engine drives. Implementations own the device.
pub trait PlaybackSink: Send + Sync {
    fn play(&self, path: &Path, volume: f32) -> Result<()>;
    fn stop_all(&self);
    fn is_playing(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let events = PlaybackEvents::new(8);
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        events.emit(PlaybackEvent::Started);
        events.emit(PlaybackEvent::Delay { millis: 120.0 });

        assert_eq!(a.recv().await.expect("event"), PlaybackEvent::Started);
        assert_eq!(b.recv().await.expect("event"), PlaybackEvent::Started);
        assert_eq!(
            a.recv().await.expect("event"),
            PlaybackEvent::Delay { millis: 120.0 }
        );
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let events = PlaybackEvents::default();
        events.emit(PlaybackEvent::Ended);
        assert_eq!(events.subscriber_count(), 0);
    }
}
