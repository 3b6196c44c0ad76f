//! Live query fan-out.
//!
//! A single actor owns a table of topics (one per user chat list and one per
//! chat message list). Each topic is a `watch` channel carrying a change
//! counter; writers bump the counter after a commit and every subscriber task
//! watching the topic re-runs its query and pushes the complete result set.

use std::{collections::HashMap, future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use shared::api::snapshot::Snapshot;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::interval,
};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Chats(String),
    Messages(String),
}

/// What a committed transaction touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub chat_id: String,
    /// Members before and after the change.
    pub user_ids: Vec<String>,
    pub messages_changed: bool,
}

impl ChangeEvent {
    fn topics(&self) -> impl Iterator<Item = Topic> + '_ {
        let messages = self
            .messages_changed
            .then(|| Topic::Messages(self.chat_id.clone()));

        self.user_ids
            .iter()
            .map(|user_id| Topic::Chats(user_id.clone()))
            .chain(messages)
    }
}

enum Command {
    Watch {
        topic: Topic,
        res_tx: oneshot::Sender<watch::Receiver<u64>>,
    },

    Publish {
        event: ChangeEvent,
        relay: bool,
    },
}

pub struct FanoutServer {
    topics: HashMap<Topic, watch::Sender<u64>>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,

    relay_tx: Option<mpsc::UnboundedSender<ChangeEvent>>,

    sweep_interval: Duration,
}

impl FanoutServer {
    pub fn new(sweep_interval: Duration, buffer: usize) -> (Self, FanoutHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        (
            Self {
                topics: HashMap::new(),
                cmd_rx,
                relay_tx: None,
                sweep_interval,
            },
            FanoutHandle {
                cmd_tx,
                buffer: buffer.max(1),
            },
        )
    }

    /// Forward locally originated events to another instance bus.
    pub fn with_relay(mut self, relay_tx: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        self.relay_tx = Some(relay_tx);
        self
    }

    fn watch(&mut self, topic: Topic) -> watch::Receiver<u64> {
        self.topics
            .entry(topic)
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    fn publish(&mut self, event: ChangeEvent, relay: bool) {
        for topic in event.topics() {
            if let Some(tx) = self.topics.get(&topic) {
                tx.send_modify(|counter| *counter += 1);
            }
        }

        if relay {
            if let Some(relay_tx) = &self.relay_tx {
                let _ = relay_tx.send(event);
            }
        }
    }

    fn sweep(&mut self) {
        let before = self.topics.len();

        self.topics.retain(|_, tx| tx.receiver_count() > 0);

        let released = before - self.topics.len();
        if released > 0 {
            debug!(released, "released idle fan-out topics");
        }
    }

    pub async fn run(mut self) {
        let mut sweep = interval(self.sweep_interval);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Watch { topic, res_tx }) => {
                        let _ = res_tx.send(self.watch(topic));
                    }

                    Some(Command::Publish { event, relay }) => {
                        self.publish(event, relay);
                    }

                    None => break,
                },

                _ = sweep.tick() => self.sweep(),
            }
        }

        info!("fan-out server stopped");
    }
}

#[derive(Clone)]
pub struct FanoutHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,

    buffer: usize,
}

impl FanoutHandle {
    async fn watch(&self, topic: Topic) -> AppResult<watch::Receiver<u64>> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Watch { topic, res_tx })
            .map_err(|_| AppError::Unavailable("fan-out server stopped".to_string()))?;

        res_rx
            .await
            .map_err(|_| AppError::Unavailable("fan-out server stopped".to_string()))
    }

    /// Announce a locally committed change.
    pub fn publish(&self, event: ChangeEvent) {
        if self.cmd_tx.send(Command::Publish { event, relay: true }).is_err() {
            warn!("fan-out server stopped; dropping change event");
        }
    }

    /// Announce a change committed by another instance.
    pub fn publish_remote(&self, event: ChangeEvent) {
        let _ = self.cmd_tx.send(Command::Publish {
            event,
            relay: false,
        });
    }

    /// Open a live query. The first snapshot is the current result of
    /// `query`; afterwards a new snapshot is pushed whenever the topic
    /// changes and the result differs from the last one delivered.
    pub async fn subscribe<T, F, Fut>(&self, topic: Topic, query: F) -> AppResult<Subscription<T>>
    where
        T: PartialEq + Clone + Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        // register interest before the first read so no change slips between
        let mut changes = self.watch(topic.clone()).await?;
        changes.borrow_and_update();

        let mut last = query().await?;

        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(Snapshot {
            generation: 1,
            items: last.clone(),
        });

        tokio::spawn(async move {
            let mut generation = 1;

            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }

                    _ = tx.closed() => break,
                }

                changes.borrow_and_update();

                let items = match query().await {
                    Ok(items) => items,
                    Err(err) => {
                        warn!(?topic, %err, "subscription query failed; closing");
                        break;
                    }
                };

                if items == last {
                    continue;
                }

                generation += 1;

                let snapshot = Snapshot {
                    generation,
                    items: items.clone(),
                };

                if tx.send(snapshot).await.is_err() {
                    break;
                }

                last = items;
            }

            debug!(?topic, "subscription finished");
        });

        Ok(Subscription {
            rx,
            cancelled: false,
        })
    }
}

/// Receiving end of a live query. Dropping it cancels the subscription.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Snapshot<T>>,
    cancelled: bool,
}

impl<T> Subscription<T> {
    /// Next snapshot, or `None` once cancelled or closed by the server.
    pub async fn next(&mut self) -> Option<Snapshot<T>> {
        if self.cancelled {
            return None;
        }

        self.rx.recv().await
    }

    /// Stops deliveries. Buffered snapshots are discarded; calling it again
    /// has no effect.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.rx.close();
        }
    }
}
