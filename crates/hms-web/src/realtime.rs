//! WebSocket 实时推送
//!
//! 客户端连接 `GET /ws?token=...&rooms=visits,stage:pharmacy` 后收到所在房间的通知，
//! 连接期间可以发送 `{"action": "join", "room": "billing"}` 或 `leave` 调整订阅。
//! 外部系统通过 `POST /api/socket/emit` 向房间广播，需携带 `X-Emit-Token`。

use crate::error::{ApiJson, ApiResult};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Json},
};
use futures_util::{SinkExt, StreamExt};
use hms_core::HmsError;
use hms_integration::{Notification, NotificationHub, RoomSet, BROADCAST_ROOM};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub const EMIT_TOKEN_HEADER: &str = "x-emit-token";

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
    /// 逗号分隔的房间列表
    pub rooms: Option<String>,
}

/// 客户端发来的订阅指令
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Join { room: String },
    Leave { room: String },
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerReply<'a> {
    Subscribed { rooms: &'a [String] },
    Pong,
    Error { message: String },
}

/// 解析 `rooms` 参数
pub fn initial_rooms(rooms: Option<&str>) -> RoomSet {
    let mut set = RoomSet::new();
    for room in rooms.unwrap_or_default().split(',') {
        set.join(room);
    }
    set
}

/// WebSocket 升级处理器，令牌校验通过后才升级
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> ApiResult<impl IntoResponse> {
    let token = query
        .token
        .as_deref()
        .ok_or_else(|| HmsError::Unauthorized("missing token".to_string()))?;
    let claims = state.auth.verify_token(token)?;

    let rooms = initial_rooms(query.rooms.as_deref());
    info!("WebSocket upgrade accepted for {} ({} rooms)", claims.username, rooms.rooms().len());
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, rooms, claims.username)))
}

async fn handle_socket(socket: WebSocket, hub: NotificationHub, mut rooms: RoomSet, username: String) {
    let (mut sink, mut stream) = socket.split();
    let mut notifications = hub.subscribe();

    if send_reply(&mut sink, &ServerReply::Subscribed { rooms: rooms.rooms() }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            received = notifications.recv() => {
                match received {
                    Ok(notification) => {
                        if !rooms.accepts(&notification) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&notification) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client {} lagged, skipped {} notifications", username, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::Join { room }) => {
                                rooms.join(&room);
                                ServerReply::Subscribed { rooms: rooms.rooms() }
                            }
                            Ok(ClientCommand::Leave { room }) => {
                                if room == BROADCAST_ROOM {
                                    ServerReply::Error { message: "cannot leave the broadcast room".to_string() }
                                } else {
                                    rooms.leave(&room);
                                    ServerReply::Subscribed { rooms: rooms.rooms() }
                                }
                            }
                            Ok(ClientCommand::Ping) => ServerReply::Pong,
                            Err(e) => ServerReply::Error { message: format!("unrecognised command: {}", e) },
                        };
                        if send_reply(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!("WebSocket client {} disconnected", username);
}

async fn send_reply<S>(sink: &mut S, reply: &ServerReply<'_>) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(reply).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

/// 外部广播请求
#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    pub room: Option<String>,
}

/// 向房间广播一条通知，未配置令牌时接口关闭
pub async fn emit(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<EmitRequest>,
) -> ApiResult<Json<Value>> {
    let Some(expected) = state.config.realtime.emit_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err(HmsError::Forbidden("emit endpoint is disabled".to_string()).into());
    };
    let provided = headers
        .get(EMIT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(HmsError::Unauthorized("invalid emit token".to_string()).into());
    }

    let event = request.event.trim();
    if event.is_empty() {
        return Err(HmsError::Validation("event is required".to_string()).into());
    }
    let room = request
        .room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| BROADCAST_ROOM.to_string());

    let delivered = state.hub.publish(Notification::new(event, room.clone(), request.data));
    debug!("Emitted {} to {} ({} subscribers)", event, room, delivered);
    Ok(Json(json!({ "success": true, "event": event, "room": room, "delivered": delivered })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_rooms_always_include_broadcast() {
        let rooms = initial_rooms(Some("visits, stage:pharmacy,,visits"));
        assert_eq!(rooms.rooms(), &["all", "visits", "stage:pharmacy"]);
        assert_eq!(initial_rooms(None).rooms(), &["all"]);
    }

    #[test]
    fn test_client_commands() {
        assert_eq!(
            serde_json::from_str::<ClientCommand>(r#"{"action":"join","room":"billing"}"#).unwrap(),
            ClientCommand::Join { room: "billing".to_string() }
        );
        assert_eq!(
            serde_json::from_str::<ClientCommand>(r#"{"action":"ping"}"#).unwrap(),
            ClientCommand::Ping
        );
        assert!(serde_json::from_str::<ClientCommand>(r#"{"action":"shout"}"#).is_err());
    }
}
