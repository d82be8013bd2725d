// =============================================================================
// WebSocket wire messages
// =============================================================================
//
// The JSON shapes here are bit-exact contract with the charting
// front-end. Every outbound message carries a `type` tag and an ISO
// timestamp; inbound messages are `subscribe`, `unsubscribe`, and `ping`.
// =============================================================================

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Subscription routing key kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    Strategy,
    Stock,
    Market,
}

impl SubscriptionType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strategy" => Some(Self::Strategy),
            "stock" => Some(Self::Stock),
            "market" => Some(Self::Market),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strategy => "strategy",
            Self::Stock => "stock",
            Self::Market => "market",
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_iso() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

// =============================================================================
// Inbound
// =============================================================================

/// Any client → server message; unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

// =============================================================================
// Outbound
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ConnectedMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub client_id: String,
    pub message: String,
    pub timestamp: String,
}

impl ConnectedMessage {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            message_type: "connected",
            client_id: client_id.into(),
            message: "WebSocket连接成功".into(),
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubscriptionAck {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub subscription_type: String,
    pub target: String,
    pub message: String,
    pub timestamp: String,
}

impl SubscriptionAck {
    pub fn subscribed(kind: SubscriptionType, target: &str, is_new: bool) -> Self {
        Self {
            message_type: "subscribed",
            subscription_type: kind.to_string(),
            target: target.to_string(),
            message: if is_new { "订阅成功" } else { "已订阅" }.into(),
            timestamp: now_iso(),
        }
    }

    pub fn unsubscribed(kind: SubscriptionType, target: &str, removed: bool) -> Self {
        Self {
            message_type: "unsubscribed",
            subscription_type: kind.to_string(),
            target: target.to_string(),
            message: if removed { "取消订阅成功" } else { "未订阅" }.into(),
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PongMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub timestamp: String,
}

impl PongMessage {
    pub fn new() -> Self {
        Self {
            message_type: "pong",
            timestamp: now_iso(),
        }
    }
}

impl Default for PongMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// One price row inside a `price_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i64>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct PriceUpdateMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub data: Vec<PriceUpdate>,
    pub count: usize,
    pub timestamp: String,
}

impl PriceUpdateMessage {
    pub fn new(data: Vec<PriceUpdate>) -> Self {
        Self {
            message_type: "price_update",
            count: data.len(),
            data,
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SignalUpdateMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    /// `add` or `remove`.
    pub action: String,
    pub data: Vec<serde_json::Value>,
    pub count: usize,
    pub timestamp: String,
}

impl SignalUpdateMessage {
    pub fn new(action: &str, data: Vec<serde_json::Value>) -> Self {
        Self {
            message_type: "signal_update",
            action: action.to_string(),
            count: data.len(),
            data,
            timestamp: now_iso(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub message_type: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            message_type: "error",
            error: error.into(),
            details,
            timestamp: now_iso(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_wire_shape() {
        let msg = serde_json::to_value(ConnectedMessage::new("client_abcd1234")).unwrap();
        assert_eq!(msg["type"], "connected");
        assert_eq!(msg["client_id"], "client_abcd1234");
        assert!(msg["timestamp"].is_string());
        assert!(msg["message"].is_string());
    }

    #[test]
    fn subscription_ack_shapes() {
        let sub =
            serde_json::to_value(SubscriptionAck::subscribed(SubscriptionType::Strategy, "volume_wave", true))
                .unwrap();
        assert_eq!(sub["type"], "subscribed");
        assert_eq!(sub["subscription_type"], "strategy");
        assert_eq!(sub["target"], "volume_wave");

        let unsub =
            serde_json::to_value(SubscriptionAck::unsubscribed(SubscriptionType::Stock, "600519", false))
                .unwrap();
        assert_eq!(unsub["type"], "unsubscribed");
        assert_eq!(unsub["message"], "未订阅");
    }

    #[test]
    fn price_update_wire_shape() {
        let update = PriceUpdate {
            code: "600519".into(),
            name: Some("贵州茅台".into()),
            price: 1850.5,
            change: 25.3,
            change_percent: 2.5,
            volume: Some(12_345_678),
            timestamp: "2025-06-02T10:05:00".into(),
        };
        let msg = serde_json::to_value(PriceUpdateMessage::new(vec![update])).unwrap();
        assert_eq!(msg["type"], "price_update");
        assert_eq!(msg["count"], 1);
        assert_eq!(msg["data"][0]["code"], "600519");
        assert_eq!(msg["data"][0]["price"], 1850.5);
    }

    #[test]
    fn optional_fields_omitted() {
        let update = PriceUpdate {
            code: "600519".into(),
            name: None,
            price: 10.0,
            change: 0.0,
            change_percent: 0.0,
            volume: None,
            timestamp: "t".into(),
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(!json.contains("name"));
        assert!(!json.contains("volume"));
    }

    #[test]
    fn error_wire_shape() {
        let msg = serde_json::to_value(ErrorMessage::new("消息处理失败", Some("boom".into()))).unwrap();
        assert_eq!(msg["type"], "error");
        assert_eq!(msg["details"], "boom");
    }

    #[test]
    fn inbound_parse_tolerates_missing_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.message_type, "ping");
        assert!(msg.subscription_type.is_none());

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","subscription_type":"strategy","target":"volume_wave"}"#,
        )
        .unwrap();
        assert_eq!(msg.subscription_type.as_deref(), Some("strategy"));
    }

    #[test]
    fn subscription_type_parse() {
        assert_eq!(SubscriptionType::parse("strategy"), Some(SubscriptionType::Strategy));
        assert_eq!(SubscriptionType::parse("stock"), Some(SubscriptionType::Stock));
        assert_eq!(SubscriptionType::parse("market"), Some(SubscriptionType::Market));
        assert_eq!(SubscriptionType::parse("bogus"), None);
    }
}
