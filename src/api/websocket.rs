use std::{
    collections::HashMap,
    pin::pin,
    time::{Duration, Instant},
};

use actix_web::{web, HttpRequest, Responder};
use actix_ws::{self, AggregatedMessage};
use futures_util::{
    future::{select, Either},
    StreamExt as _,
};
use shared::api::{
    snapshot::Snapshot,
    user::Claims,
    websocket::{
        WebsocketClientMessage, WebsocketClientMessageData, WebsocketServerMessage,
        WebsocketServerResData,
    },
};
use tokio::{sync::mpsc, task::JoinHandle, time::interval};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    fanout::Subscription,
    service::ChatService,
};

/// Live subscriptions opened over one connection.
type Subscriptions = HashMap<Uuid, JoinHandle<()>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn to_request_response(
    res: AppResult<WebsocketServerResData>,
    id: Uuid,
) -> WebsocketServerMessage {
    match res {
        Ok(data) => WebsocketServerMessage::RequestResponse {
            id,
            error: None,
            data: Some(data),
        },
        Err(err) => WebsocketServerMessage::RequestResponse {
            id,
            error: Some(format!("{}", err)),
            data: None,
        },
    }
}

/// Pushes every snapshot into the connection until the subscription ends,
/// then tells the client it was closed.
fn forward<T, F>(
    mut subscription: Subscription<T>,
    id: Uuid,
    conn_tx: mpsc::UnboundedSender<WebsocketServerMessage>,
    wrap: F,
) -> JoinHandle<()>
where
    T: 'static,
    F: Fn(Snapshot<T>) -> WebsocketServerMessage + 'static,
{
    actix_web::rt::spawn(async move {
        while let Some(snapshot) = subscription.next().await {
            if conn_tx.send(wrap(snapshot)).is_err() {
                return;
            }
        }

        let _ = conn_tx.send(WebsocketServerMessage::SubscriptionClosed { subscription: id });
    })
}

/// Pushes queued before an unsubscribe are dropped. A closed subscription
/// is forgotten once its close notice goes out.
fn outgoing(
    msg: WebsocketServerMessage,
    subscriptions: &mut Subscriptions,
) -> Option<WebsocketServerMessage> {
    match msg {
        WebsocketServerMessage::ChatList { subscription, .. }
        | WebsocketServerMessage::MessageList { subscription, .. }
            if !subscriptions.contains_key(&subscription) =>
        {
            None
        }
        WebsocketServerMessage::SubscriptionClosed { subscription } => subscriptions
            .remove(&subscription)
            .map(|_| WebsocketServerMessage::SubscriptionClosed { subscription }),
        msg => Some(msg),
    }
}

async fn request_handler(
    request: WebsocketClientMessage,
    service: &ChatService,
    user: &Claims,
    subscriptions: &mut Subscriptions,
    conn_tx: &mpsc::UnboundedSender<WebsocketServerMessage>,
) -> WebsocketServerMessage {
    let actor = user.user_id.as_str();

    let req_res = match request.data {
        WebsocketClientMessageData::CreateChat(req_data) => service
            .create_chat(actor, req_data)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::UpdateChat { chat_id, update } => service
            .update_chat(actor, &chat_id, update)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::TogglePin(chat_id) => service
            .toggle_pin(actor, &chat_id, actor)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::ToggleMute(chat_id) => service
            .toggle_mute(actor, &chat_id, actor)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::UpdateMembers { chat_id, members } => service
            .update_members(actor, &chat_id, members)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::ToggleAdmin { chat_id, user_id } => service
            .toggle_admin(actor, &chat_id, &user_id)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::LeaveChat(chat_id) => service
            .leave_chat(actor, &chat_id)
            .await
            .map(WebsocketServerResData::Chat),

        WebsocketClientMessageData::NewMessage { chat_id, message } => service
            .send_message(actor, &chat_id, message)
            .await
            .map(WebsocketServerResData::NewMessage),

        WebsocketClientMessageData::MarkSeen { chat_id, seen } => service
            .mark_seen(actor, &chat_id, seen)
            .await
            .map(WebsocketServerResData::Seen),

        WebsocketClientMessageData::SubscribeChats => {
            service.subscribe_chats(actor, actor).await.map(|sub| {
                let id = Uuid::new_v4();
                let handle = forward(sub, id, conn_tx.clone(), move |snapshot| {
                    WebsocketServerMessage::ChatList {
                        subscription: id,
                        snapshot,
                    }
                });
                subscriptions.insert(id, handle);

                WebsocketServerResData::Subscribed(id)
            })
        }

        WebsocketClientMessageData::SubscribeMessages(chat_id) => {
            service.subscribe_messages(actor, &chat_id).await.map(|sub| {
                let id = Uuid::new_v4();
                let handle = forward(sub, id, conn_tx.clone(), move |snapshot| {
                    WebsocketServerMessage::MessageList {
                        subscription: id,
                        chat_id: chat_id.clone(),
                        snapshot,
                    }
                });
                subscriptions.insert(id, handle);

                WebsocketServerResData::Subscribed(id)
            })
        }

        WebsocketClientMessageData::Unsubscribe(id) => match subscriptions.remove(&id) {
            Some(handle) => {
                handle.abort();
                Ok(WebsocketServerResData::Unsubscribed(id))
            }
            None => Err(AppError::NotFound(format!("subscription {id}"))),
        },
    };

    to_request_response(req_res, request.id)
}

async fn websocket(
    req: HttpRequest,
    body: web::Payload,
    user: web::ReqData<Claims>,
    service: web::Data<ChatService>,
) -> actix_web::Result<impl Responder> {
    let (res, mut session, msg_stream) = actix_ws::handle(&req, body)?;

    actix_web::rt::spawn(async move {
        let user = user.into_inner();

        info!(user_id = %user.user_id, "websocket connected");

        let mut last_heartbeat = Instant::now();
        let mut interval = interval(HEARTBEAT_INTERVAL);

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let mut subscriptions = Subscriptions::new();

        let msg_stream_f = msg_stream
            .max_frame_size(128 * 1024)
            .aggregate_continuations()
            .max_continuation_size(2 * 1024 * 1024);

        let mut msg_stream = pin!(msg_stream_f);

        let close_reason = loop {
            let tick = pin!(interval.tick());
            let msg_rx = pin!(conn_rx.recv());

            let messages = pin!(select(msg_stream.next(), msg_rx));

            match select(messages, tick).await {
                // commands & messages received from client
                Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                    AggregatedMessage::Ping(bytes) => {
                        last_heartbeat = Instant::now();

                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }

                    AggregatedMessage::Pong(_) => {
                        last_heartbeat = Instant::now();
                    }

                    AggregatedMessage::Close(reason) => break reason,

                    AggregatedMessage::Text(payload) => {
                        last_heartbeat = Instant::now();

                        let request = match serde_json::from_str::<WebsocketClientMessage>(&payload)
                        {
                            Ok(request) => request,
                            Err(err) => {
                                debug!(%err, "ignoring malformed websocket request");
                                continue;
                            }
                        };

                        let res = request_handler(
                            request,
                            &service,
                            &user,
                            &mut subscriptions,
                            &conn_tx,
                        )
                        .await;

                        if let Ok(string_payload) = serde_json::to_string(&res) {
                            if session.text(string_payload).await.is_err() {
                                break None;
                            }
                        }
                    }

                    AggregatedMessage::Binary(_) => {
                        last_heartbeat = Instant::now();
                    }
                },

                // ws stream error
                Either::Left((Either::Left((Some(Err(_err)), _)), _)) => {
                    break None;
                }

                // ws stream end
                Either::Left((Either::Left((None, _)), _)) => break None,

                Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                    let Some(ws_msg) = outgoing(ws_msg, &mut subscriptions) else {
                        continue;
                    };

                    if let Ok(notif) = serde_json::to_string(&ws_msg) {
                        if session.text(notif).await.is_err() {
                            break None;
                        }
                    }
                }

                // unreachable while `conn_tx` is alive
                Either::Left((Either::Right((None, _)), _)) => break None,

                Either::Right((_inst, _)) => {
                    if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                        break None;
                    }

                    let _ = session.ping(b"").await;
                }
            }
        };

        for (_, handle) in subscriptions.drain() {
            handle.abort();
        }

        info!(user_id = %user.user_id, "websocket disconnected");

        let _ = session.close(close_reason).await;
    });

    Ok(res)
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.route("", web::get().to(websocket));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shared::api::chat::CreateRequest;
    use shared::models::chat::ChatType;
    use tokio::time::timeout;

    use super::*;
    use crate::testing;

    fn claims(user_id: &str) -> Claims {
        Claims {
            user_id: user_id.to_string(),
            exp: 4_102_444_800,
        }
    }

    fn request(data: WebsocketClientMessageData) -> WebsocketClientMessage {
        WebsocketClientMessage {
            id: Uuid::new_v4(),
            data,
        }
    }

    async fn recv(
        conn_rx: &mut mpsc::UnboundedReceiver<WebsocketServerMessage>,
    ) -> WebsocketServerMessage {
        timeout(Duration::from_secs(1), conn_rx.recv())
            .await
            .expect("no push within a second")
            .expect("connection channel closed")
    }

    #[actix_web::test]
    async fn subscription_pushes_until_unsubscribed() {
        let service = testing::service();
        let user = claims("B");
        let mut subscriptions = Subscriptions::new();
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

        let res = request_handler(
            request(WebsocketClientMessageData::SubscribeChats),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;
        let subscription = match res {
            WebsocketServerMessage::RequestResponse {
                data: Some(WebsocketServerResData::Subscribed(id)),
                ..
            } => id,
            other => panic!("unexpected response {other:?}"),
        };

        match recv(&mut conn_rx).await {
            WebsocketServerMessage::ChatList {
                subscription: id,
                snapshot,
            } => {
                assert_eq!(id, subscription);
                assert!(snapshot.items.is_empty());
            }
            other => panic!("unexpected push {other:?}"),
        }

        let res = request_handler(
            request(WebsocketClientMessageData::CreateChat(CreateRequest {
                member_ids: vec!["A".to_string()],
                chat_type: ChatType::Individual,
                name: None,
                image_url: None,
            })),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;
        assert!(matches!(
            res,
            WebsocketServerMessage::RequestResponse { error: None, .. }
        ));

        match recv(&mut conn_rx).await {
            WebsocketServerMessage::ChatList { snapshot, .. } => {
                assert_eq!(snapshot.generation, 2);
                assert_eq!(snapshot.items[0].id, "A_B");
            }
            other => panic!("unexpected push {other:?}"),
        }

        let res = request_handler(
            request(WebsocketClientMessageData::Unsubscribe(subscription)),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;
        assert!(matches!(
            res,
            WebsocketServerMessage::RequestResponse {
                data: Some(WebsocketServerResData::Unsubscribed(_)),
                ..
            }
        ));
        assert!(subscriptions.is_empty());

        testing::group(&service, "A", &["B"]).await;
        assert!(timeout(Duration::from_millis(100), conn_rx.recv())
            .await
            .is_err());
    }

    #[actix_web::test]
    async fn queued_pushes_are_dropped_after_unsubscribe() {
        let service = testing::service();
        let user = claims("B");
        let mut subscriptions = Subscriptions::new();
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

        let res = request_handler(
            request(WebsocketClientMessageData::SubscribeChats),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;
        let subscription = match res {
            WebsocketServerMessage::RequestResponse {
                data: Some(WebsocketServerResData::Subscribed(id)),
                ..
            } => id,
            other => panic!("unexpected response {other:?}"),
        };

        // let the first snapshot land in the connection queue
        tokio::time::sleep(Duration::from_millis(50)).await;

        request_handler(
            request(WebsocketClientMessageData::Unsubscribe(subscription)),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;

        let queued = conn_rx.try_recv().expect("snapshot was queued");
        assert!(matches!(queued, WebsocketServerMessage::ChatList { .. }));
        assert!(outgoing(queued, &mut subscriptions).is_none());
    }

    #[actix_web::test]
    async fn close_notice_forgets_the_subscription() {
        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
        let mut subscriptions = Subscriptions::new();
        let id = Uuid::new_v4();
        subscriptions.insert(id, actix_web::rt::spawn(async {}));

        conn_tx
            .send(WebsocketServerMessage::SubscriptionClosed { subscription: id })
            .unwrap();
        let notice = conn_rx.recv().await.unwrap();

        assert!(outgoing(notice.clone(), &mut subscriptions).is_some());
        assert!(subscriptions.is_empty());
        assert!(outgoing(notice, &mut subscriptions).is_none());
    }

    #[actix_web::test]
    async fn failures_come_back_as_error_responses() {
        let service = testing::service();
        let user = claims("C");
        let chat = testing::group(&service, "A", &["B"]).await;
        let mut subscriptions = Subscriptions::new();
        let (conn_tx, _conn_rx) = mpsc::unbounded_channel();

        let req = request(WebsocketClientMessageData::SubscribeMessages(chat.id));
        let req_id = req.id;
        let res = request_handler(req, &service, &user, &mut subscriptions, &conn_tx).await;

        match res {
            WebsocketServerMessage::RequestResponse { id, data, error } => {
                assert_eq!(id, req_id);
                assert!(data.is_none());
                assert!(error.unwrap().contains("not found"));
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert!(subscriptions.is_empty());

        let res = request_handler(
            request(WebsocketClientMessageData::Unsubscribe(Uuid::new_v4())),
            &service,
            &user,
            &mut subscriptions,
            &conn_tx,
        )
        .await;
        assert!(matches!(
            res,
            WebsocketServerMessage::RequestResponse { error: Some(_), .. }
        ));
    }
}
