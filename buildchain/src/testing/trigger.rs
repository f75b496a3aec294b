//! A trigger source fed through a channel.

use crate::core::ChangeEvent;
use crate::interfaces::TriggerSource;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A [`TriggerSource`] whose events are pushed by the test.
///
/// Only the first subscriber receives events; later subscriptions get an
/// empty stream. The stream ends once every sender is dropped.
#[derive(Debug)]
pub struct ChannelTriggerSource {
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
}

impl ChannelTriggerSource {
    /// Creates a source and the sender that feeds it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedSender<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl TriggerSource for ChannelTriggerSource {
    fn subscribe(&self) -> BoxStream<'static, ChangeEvent> {
        match self.receiver.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_sent_events() {
        let (source, tx) = ChannelTriggerSource::new();
        tx.send(ChangeEvent::new("app", "refs/heads/main", "abc")).unwrap();
        tx.send(ChangeEvent::new("app", "refs/heads/dev", "def")).unwrap();
        drop(tx);

        let events: Vec<_> = source.subscribe().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].revision, "def");
    }

    #[tokio::test]
    async fn test_second_subscription_is_empty() {
        let (source, _tx) = ChannelTriggerSource::new();
        let _first = source.subscribe();
        let second: Vec<_> = source.subscribe().collect().await;
        assert!(second.is_empty());
    }
}
