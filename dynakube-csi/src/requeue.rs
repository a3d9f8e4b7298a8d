//! A channel of keys that become ready after a delay
//!
//! Requeueing a key that is already pending moves its deadline rather than
//! scheduling it twice.

use futures_util::StreamExt;
use std::{
    collections::{hash_map, HashMap},
    hash::Hash,
};
use tokio::{
    sync::mpsc::{self, error::SendError},
    time::{Duration, Instant},
};
use tokio_util::time::{delay_queue, DelayQueue};

/// Schedules keys.
#[derive(Debug)]
pub struct Sender<K> {
    tx: mpsc::Sender<(K, Instant)>,
}

/// Yields keys once their deadline passes.
#[derive(Debug)]
pub struct Receiver<K> {
    rx: mpsc::Receiver<(K, Instant)>,
    rx_closed: bool,
    q: DelayQueue<K>,
    pending: HashMap<K, delay_queue::Key>,
}

/// Creates a requeue channel buffering up to `capacity` unprocessed
/// requests.
pub fn channel<K>(capacity: usize) -> (Sender<K>, Receiver<K>)
where
    K: Clone + Eq + Hash,
{
    let (tx, rx) = mpsc::channel(capacity);
    let tx = Sender { tx };
    let rx = Receiver {
        rx,
        rx_closed: false,
        q: DelayQueue::new(),
        pending: HashMap::new(),
    };
    (tx, rx)
}

// === impl Receiver ===

impl<K> Receiver<K>
where
    K: Clone + Eq + Hash,
{
    /// Waits for the next key to become ready.
    ///
    /// Returns `None` once every sender is dropped and no keys are pending.
    pub async fn recv(&mut self) -> Option<K> {
        while !(self.rx_closed && self.pending.is_empty()) {
            tokio::select! {
                k = self.rx.recv(), if !self.rx_closed => match k {
                    Some((k, at)) => match self.pending.entry(k) {
                        hash_map::Entry::Occupied(ent) => {
                            self.q.reset_at(ent.get(), at);
                        }
                        hash_map::Entry::Vacant(slot) => {
                            let key = self.q.insert_at(slot.key().clone(), at);
                            slot.insert(key);
                        }
                    },
                    None => {
                        self.rx_closed = true;
                    }
                },

                exp = self.q.next(), if !self.pending.is_empty() => {
                    if let Some(exp) = exp {
                        let k = exp.into_inner();
                        self.pending.remove(&k);
                        return Some(k);
                    }
                }
            }
        }

        None
    }
}

// === impl Sender ===

impl<K> Sender<K> {
    /// Waits for the receiver to be dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Schedules `key` to be ready after `wait`.
    pub async fn requeue(&self, key: K, wait: Duration) -> Result<(), SendError<(K, Instant)>> {
        self.requeue_at(key, Instant::now() + wait).await
    }

    /// Schedules `key` to be ready at `time`.
    pub async fn requeue_at(&self, key: K, time: Instant) -> Result<(), SendError<(K, Instant)>> {
        self.tx.send((key, time)).await
    }
}

impl<K> Clone for Sender<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}
