use std::pin::pin;

use futures_util::{
    future::{select, Either},
    StreamExt,
};
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, unbounded_channel};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    fanout::{ChangeEvent, FanoutHandle},
};

const CHANNEL: &str = "chat_changes";

/// Relays committed change events between server instances so that
/// subscribers connected to one instance see writes made on another.
pub struct RedisRelay {
    client: Client,
    origin: Uuid,
    fanout: FanoutHandle,
    event_rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub event: ChangeEvent,
}

impl RedisRelay {
    /// Returns the relay and the sender the fan-out server forwards local
    /// events into.
    pub fn new(
        url: &str,
        fanout: FanoutHandle,
    ) -> anyhow::Result<(Self, mpsc::UnboundedSender<ChangeEvent>)> {
        let (event_tx, event_rx) = unbounded_channel();

        let client = Client::open(url)?;

        Ok((
            Self {
                client,
                origin: Uuid::new_v4(),
                fanout,
                event_rx,
            },
            event_tx,
        ))
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let (mut sink, mut stream) = self.client.get_async_pubsub().await?.split();
        let mut con = self.client.get_multiplexed_async_connection().await?;

        sink.subscribe(CHANNEL).await?;

        info!(origin = %self.origin, "redis relay subscribed to {CHANNEL}");

        loop {
            let remote = pin!(stream.next());
            let local = pin!(self.event_rx.recv());

            match select(local, remote).await {
                Either::Left((Some(event), _)) => {
                    let envelope = RelayEnvelope {
                        origin: self.origin,
                        event,
                    };

                    if let Err(err) = publish(&mut con, &envelope).await {
                        warn!(%err, chat_id = %envelope.event.chat_id, "failed to relay change");
                    }
                }

                // fan-out server gone
                Either::Left((None, _)) => break,

                Either::Right((Some(msg), _)) => {
                    let payload: Vec<u8> = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(%err, "unreadable relay payload");
                            continue;
                        }
                    };

                    if let Some(event) = accept(self.origin, &payload) {
                        debug!(chat_id = %event.chat_id, "change from another instance");
                        self.fanout.publish_remote(event);
                    }
                }

                Either::Right((None, _)) => {
                    anyhow::bail!("redis pub/sub stream closed");
                }
            }
        }

        Ok(())
    }
}

async fn publish(
    con: &mut redis::aio::MultiplexedConnection,
    envelope: &RelayEnvelope,
) -> AppResult<()> {
    let bytes = serde_json::to_vec(envelope)
        .map_err(|err| AppError::Unavailable(format!("encoding relay event: {err}")))?;

    con.publish::<_, _, i64>(CHANNEL, bytes).await?;

    Ok(())
}

/// Events published by other instances. Our own echoes and garbage are dropped.
fn accept(origin: Uuid, payload: &[u8]) -> Option<ChangeEvent> {
    let envelope: RelayEnvelope = serde_json::from_slice(payload).ok()?;

    (envelope.origin != origin).then_some(envelope.event)
}
