//! Topic channel: a joined gossip topic with publish and subscription.
//!
//! Two publish policies drive a topic, never both in one process:
//! a periodic canned payload, or operator lines forwarded verbatim. Either
//! runs alongside a subscription consumer that renders inbound messages.

use std::sync::Arc;
use std::time::Duration;

use pleb_core::TopicMessage;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::P2pError;
use crate::handle::PubSub;

/// A joined topic. Cloning shares the same underlying pubsub service.
pub struct TopicHandle<P: ?Sized> {
    name: String,
    pubsub: Arc<P>,
}

impl<P: ?Sized> Clone for TopicHandle<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pubsub: Arc::clone(&self.pubsub),
        }
    }
}

impl<P: PubSub + ?Sized> TopicHandle<P> {
    /// Join `name` on `pubsub`. Joining an already joined topic is a no-op.
    pub async fn join(pubsub: Arc<P>, name: &str) -> Result<Self, P2pError> {
        pubsub.join(name).await?;
        Ok(Self {
            name: name.to_string(),
            pubsub,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort publish. The caller decides what a failure means.
    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> Result<(), P2pError> {
        self.pubsub.publish(&self.name, data.into()).await
    }

    /// Start receiving. The sequence ends when `cancel` fires.
    pub async fn subscribe(&self, cancel: CancellationToken) -> Result<Subscription, P2pError> {
        let rx = self.pubsub.subscribe(&self.name).await?;
        Ok(Subscription {
            topic: self.name.clone(),
            rx,
            cancel,
        })
    }
}

/// Inbound message sequence for one topic.
///
/// There is no graceful end: `next` either yields a message or fails with
/// `Cancelled` / `SubscriptionClosed`, and the consumer treats both as fatal.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<TopicMessage>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Result<TopicMessage, P2pError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(P2pError::Cancelled),
            msg = self.rx.recv() => msg.ok_or_else(|| P2pError::SubscriptionClosed(self.topic.clone())),
        }
    }
}

/// Render `msg` as `<sender> : <text>`.
pub fn render_message(msg: &TopicMessage) -> String {
    let text = msg.text();
    format!("{} : {}\n", msg.sender(), text.trim_end_matches(['\r', '\n']))
}

/// Print every inbound message until the subscription fails.
///
/// Always returns an error; the caller decides whether it is fatal.
pub async fn consume<W>(sub: &mut Subscription, out: &mut W) -> P2pError
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match sub.next().await {
            Ok(msg) => msg,
            Err(e) => return e,
        };
        debug!(topic = %sub.topic(), from = %msg.received_from, bytes = msg.data.len(), "topic message");
        if let Err(e) = out.write_all(render_message(&msg).as_bytes()).await {
            return e.into();
        }
        if let Err(e) = out.flush().await {
            return e.into();
        }
    }
}

/// Publish `payload` every `every` until cancelled. The first publish happens
/// one interval after start.
///
/// Failures are reported and the next attempt proceeds as scheduled. Returns
/// the number of attempts made.
pub async fn run_periodic_publish<P>(
    topic: &TopicHandle<P>,
    payload: Vec<u8>,
    every: Duration,
    cancel: CancellationToken,
) -> u64
where
    P: PubSub + ?Sized,
{
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        attempts += 1;
        if let Err(e) = topic.publish(payload.clone()).await {
            warn!(topic = %topic.name(), attempt = attempts, error = %e, "### Publish error");
        }
    }

    debug!(topic = %topic.name(), attempts, "periodic publisher stopped");
    attempts
}

/// Publish each operator line verbatim until the input closes or `cancel`
/// fires. Returns the number of lines handed to the topic.
pub async fn run_interactive_publish<P>(
    topic: &TopicHandle<P>,
    mut input: broadcast::Receiver<String>,
    cancel: CancellationToken,
) -> u64
where
    P: PubSub + ?Sized,
{
    let mut published = 0u64;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = input.recv() => line,
        };

        match line {
            Ok(line) => {
                published += 1;
                if let Err(e) = topic.publish(line.into_bytes()).await {
                    warn!(topic = %topic.name(), error = %e, "### Publish error");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "console input lagged; lines dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!(topic = %topic.name(), "console input closed; interactive publisher stopping");
                break;
            }
        }
    }

    published
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBus, MockPubSub};
    use libp2p::PeerId;

    #[tokio::test]
    async fn join_is_idempotent() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        let a = TopicHandle::join(Arc::clone(&ps), "demo").await.unwrap();
        let b = TopicHandle::join(Arc::clone(&ps), "demo").await.unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(bus.members("demo"), 1);
    }

    #[tokio::test]
    async fn published_message_reaches_other_subscriber() {
        let bus = MockBus::new();
        let a_id = PeerId::random();
        let a = Arc::new(MockPubSub::on_bus(a_id, &bus));
        let b = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));

        let topic_a = TopicHandle::join(a, "demo").await.unwrap();
        let topic_b = TopicHandle::join(b, "demo").await.unwrap();
        let mut sub = topic_b.subscribe(CancellationToken::new()).await.unwrap();

        topic_a.publish("hello from libp2p go").await.unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.sender(), a_id);
        assert_eq!(msg.text(), "hello from libp2p go");
    }

    #[tokio::test]
    async fn cancellation_ends_subscription() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        let topic = TopicHandle::join(ps, "demo").await.unwrap();
        let cancel = CancellationToken::new();
        let mut sub = topic.subscribe(cancel.clone()).await.unwrap();

        cancel.cancel();
        assert!(matches!(sub.next().await, Err(P2pError::Cancelled)));
    }

    #[tokio::test]
    async fn second_live_subscription_rejected() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        let topic = TopicHandle::join(ps, "demo").await.unwrap();
        let _first = topic.subscribe(CancellationToken::new()).await.unwrap();
        assert!(topic.subscribe(CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn consume_renders_sender_and_payload() {
        let bus = MockBus::new();
        let a_id = PeerId::random();
        let a = TopicHandle::join(Arc::new(MockPubSub::on_bus(a_id, &bus)), "demo")
            .await
            .unwrap();
        let b = TopicHandle::join(Arc::new(MockPubSub::on_bus(PeerId::random(), &bus)), "demo")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut sub = b.subscribe(cancel.clone()).await.unwrap();
        a.publish("hello from libp2p go").await.unwrap();
        a.publish("second\n").await.unwrap();

        let (mut out, mut rendered) = tokio::io::duplex(1024);
        let consumer = tokio::spawn(async move { consume(&mut sub, &mut out).await });

        let expected = format!("{a_id} : hello from libp2p go\n{a_id} : second\n");
        let mut buf = vec![0u8; expected.len()];
        tokio::io::AsyncReadExt::read_exact(&mut rendered, &mut buf)
            .await
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);

        cancel.cancel();
        assert!(matches!(consumer.await.unwrap(), P2pError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_publisher_survives_failures() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        ps.fail_next(3);
        let topic = TopicHandle::join(Arc::clone(&ps), "demo").await.unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let topic = topic.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_periodic_publish(&topic, b"hello".to_vec(), Duration::from_secs(5), cancel)
                    .await
            })
        };

        // Four intervals: three failures, then a success.
        tokio::time::sleep(Duration::from_secs(21)).await;
        cancel.cancel();
        let attempts = task.await.unwrap();

        assert_eq!(attempts, 4);
        assert_eq!(ps.publish_attempts(), 4);
        assert_eq!(ps.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_publisher_waits_one_interval_first() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        let topic = TopicHandle::join(Arc::clone(&ps), "demo").await.unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_periodic_publish(&topic, b"x".to_vec(), Duration::from_secs(5), cancel).await
            })
        };

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(ps.publish_attempts(), 0);
        cancel.cancel();
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn interactive_publisher_forwards_lines_verbatim() {
        let bus = MockBus::new();
        let ps = Arc::new(MockPubSub::on_bus(PeerId::random(), &bus));
        ps.fail_next(1);
        let topic = TopicHandle::join(Arc::clone(&ps), "demo").await.unwrap();
        let (tx, rx) = broadcast::channel(8);

        tx.send("first\n".to_string()).unwrap();
        tx.send("second\n".to_string()).unwrap();
        drop(tx);

        let count = run_interactive_publish(&topic, rx, CancellationToken::new()).await;
        assert_eq!(count, 2);
        assert_eq!(ps.published(), vec![("demo".to_string(), b"second\n".to_vec())]);
    }
}
