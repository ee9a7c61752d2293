//! 实时通知中转
//!
//! 业务事件发布到进程内广播通道，WebSocket 连接按房间过滤后推送给浏览器。
//! 没有订阅者时事件直接丢弃，慢速订阅者错过的事件不补发。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// 全体客户端默认加入的房间
pub const BROADCAST_ROOM: &str = "all";

/// 推送给客户端的通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub event: String,
    pub room: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: impl Into<String>, room: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            room: room.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// 通知中心
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布到单个房间，返回收到通知的订阅者数量
    pub fn publish(&self, notification: Notification) -> usize {
        debug!("Publishing {} to room {}", notification.event, notification.room);
        self.sender.send(notification).unwrap_or(0)
    }

    /// 同一事件发布到多个房间
    pub fn publish_to_rooms<I, S>(&self, event: &str, rooms: I, data: serde_json::Value) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        rooms
            .into_iter()
            .map(|room| self.publish(Notification::new(event, room, data.clone())))
            .sum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 单个连接的房间订阅
#[derive(Debug, Clone, Default)]
pub struct RoomSet {
    rooms: Vec<String>,
}

impl RoomSet {
    pub fn new() -> Self {
        Self {
            rooms: vec![BROADCAST_ROOM.to_string()],
        }
    }

    pub fn join(&mut self, room: &str) -> bool {
        let room = room.trim();
        if room.is_empty() || self.contains(room) {
            return false;
        }
        self.rooms.push(room.to_string());
        true
    }

    pub fn leave(&mut self, room: &str) -> bool {
        let before = self.rooms.len();
        self.rooms.retain(|r| r != room.trim());
        self.rooms.len() != before
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.iter().any(|r| r == room)
    }

    /// 该连接是否应收到这条通知
    pub fn accepts(&self, notification: &Notification) -> bool {
        notification.room == BROADCAST_ROOM || self.contains(&notification.room)
    }

    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let hub = NotificationHub::new(16);
        assert_eq!(hub.publish(Notification::new("noop", "visits", serde_json::Value::Null)), 0);

        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        let delivered = hub.publish_to_rooms("visit.transitioned", ["visits", "stage:nurse"], serde_json::json!({"id": 1}));
        assert_eq!(delivered, 4);

        let received = first.recv().await.unwrap();
        assert_eq!(received.event, "visit.transitioned");
        assert_eq!(received.room, "visits");
        assert_eq!(second.recv().await.unwrap().room, "visits");
        assert_eq!(second.recv().await.unwrap().room, "stage:nurse");
    }

    #[test]
    fn test_room_filtering() {
        let mut rooms = RoomSet::new();
        assert!(rooms.join("stage:pharmacy"));
        assert!(!rooms.join("stage:pharmacy"));
        assert!(!rooms.join("  "));

        let pharmacy = Notification::new("visit.transitioned", "stage:pharmacy", serde_json::Value::Null);
        let billing = Notification::new("payment.received", "billing", serde_json::Value::Null);
        let everyone = Notification::new("system", BROADCAST_ROOM, serde_json::Value::Null);
        assert!(rooms.accepts(&pharmacy));
        assert!(!rooms.accepts(&billing));
        assert!(rooms.accepts(&everyone));

        assert!(rooms.leave("stage:pharmacy"));
        assert!(!rooms.accepts(&pharmacy));
    }
}
