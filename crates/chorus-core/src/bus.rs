//! Subscription Bus (spec §4.A): a generic, index-keyed pub/sub primitive.
//!
//! Subscribers join at a sequence index and receive only values published
//! with a higher index. A subscriber that can't keep up is dropped rather
//! than allowed to stall the publisher — `Publish`/`Broadcast` never block
//! on a slow reader.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAILBOX_CAPACITY: usize = 10;

struct Subscriber<T> {
    since_index: i64,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
}

struct Inner<T> {
    subscribers: Vec<Subscriber<T>>,
}

/// A generic pub/sub bus. `T` is the value type (the bus carries stream
/// snapshots in `chorus-agent`/`chorus-gateway`, but the primitive itself
/// is domain-agnostic).
pub struct Bus<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
            }),
        }
    }
}

impl<T: Clone + Send + 'static> Bus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber interested in values published with an index
    /// strictly greater than `since_index`. Returns a handle whose `next()`
    /// yields values in publication order or a terminal `None`.
    pub fn subscribe(&self, cancel: CancellationToken, since_index: i64) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.subscribers.push(Subscriber {
            since_index,
            tx,
            cancel: cancel.clone(),
        });
        Subscription { rx, cancel }
    }

    /// Delivers `value` to every subscriber whose `since_index < index`,
    /// advancing those subscribers' `since_index` to `index`. Subscribers
    /// already caught up (`since_index >= index`) are untouched. A
    /// subscriber whose mailbox is full is dropped, never blocked on.
    pub fn publish(&self, index: i64, value: T) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.subscribers.retain_mut(|sub| {
            if sub.cancel.is_cancelled() {
                return false;
            }
            if sub.since_index >= index {
                return true;
            }
            match sub.tx.try_send(value.clone()) {
                Ok(()) => {
                    sub.since_index = index;
                    true
                }
                Err(_) => {
                    sub.cancel.cancel();
                    false
                }
            }
        });
    }

    /// Delivers `value` to every live subscriber regardless of index;
    /// does not advance `since_index`. Used for out-of-band notifications
    /// such as conversation-list changes.
    pub fn broadcast(&self, value: T) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.subscribers.retain_mut(|sub| {
            if sub.cancel.is_cancelled() {
                return false;
            }
            match sub.tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(_) => {
                    sub.cancel.cancel();
                    false
                }
            }
        });
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("bus mutex poisoned").subscribers.len()
    }
}

/// Handle returned by `Bus::subscribe`. `next()` is the blocking `NextFn`
/// from the contract.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> Subscription<T> {
    /// Yields the next value, or `None` once cancelled and drained. A
    /// cancelled subscription still yields any value already enqueued
    /// before reporting termination — no already-accepted value is lost.
    pub async fn next(&mut self) -> Option<T> {
        tokio::select! {
            biased;
            v = self.rx.recv() => v,
            _ = self.cancel.cancelled() => self.rx.try_recv().ok(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_only_to_subscribers_behind_the_index() {
        let bus: Bus<u32> = Bus::new();
        let mut caught_up = bus.subscribe(CancellationToken::new(), 5);
        let mut behind = bus.subscribe(CancellationToken::new(), -1);

        bus.publish(5, 100);
        // caught_up already at since_index=5, publish(5, ..) is a no-op for it.
        bus.publish(6, 200);

        assert_eq!(behind.next().await, Some(100));
        assert_eq!(behind.next().await, Some(200));
        assert_eq!(caught_up.next().await, Some(200));
    }

    #[tokio::test]
    async fn behind_subscriber_is_dropped_without_stalling_publish() {
        let bus: Bus<u32> = Bus::new();
        let mut fast = bus.subscribe(CancellationToken::new(), -1);
        let mut slow = bus.subscribe(CancellationToken::new(), -1);

        for i in 0..11i64 {
            bus.publish(i, i as u32);
        }

        // slow never called next(), so its 10-slot mailbox overflowed on the
        // 11th publish and it was reaped.
        assert_eq!(bus.subscriber_count(), 1);
        for i in 0..10u32 {
            assert_eq!(fast.next().await, Some(i));
        }
        assert_eq!(fast.next().await, Some(10));

        // slow still drains what made it into the mailbox before the drop,
        // then reports terminal.
        let mut drained = Vec::new();
        while let Some(v) = slow.next().await {
            drained.push(v);
        }
        assert_eq!(drained, (0u32..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn broadcast_ignores_since_index() {
        let bus: Bus<&'static str> = Bus::new();
        let mut sub = bus.subscribe(CancellationToken::new(), 1000);
        bus.broadcast("list-changed");
        assert_eq!(sub.next().await, Some("list-changed"));
    }

    #[tokio::test]
    async fn external_cancel_drains_then_terminates() {
        let bus: Bus<u32> = Bus::new();
        let token = CancellationToken::new();
        let mut sub = bus.subscribe(token.clone(), -1);
        bus.publish(0, 42);
        token.cancel();
        assert_eq!(sub.next().await, Some(42));
        assert_eq!(sub.next().await, None);
    }
}
