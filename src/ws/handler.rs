// =============================================================================
// WebSocket message handler
// =============================================================================
//
// Validates inbound client messages, mutates the subscription manager,
// and produces the matching ack (or an error message). Subscribing to a
// strategy name that is not (yet) registered is accepted without
// validation: strategy names can be produced after the subscription.
// =============================================================================

use serde_json::Value;
use tracing::debug;

use crate::ws::messages::{
    ClientMessage, ErrorMessage, PongMessage, SubscriptionAck, SubscriptionType,
};
use crate::ws::WsHub;

/// Handle one inbound text frame; returns the JSON response to queue, or
/// `None` when no reply is needed.
pub fn handle_message(hub: &WsHub, client_id: &str, raw: &str) -> Option<Value> {
    let parsed: ClientMessage = match serde_json::from_str(raw) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(client_id, error = %e, "undecodable client message");
            return Some(to_value(ErrorMessage::new(
                "消息格式错误",
                Some(e.to_string()),
            )));
        }
    };

    match parsed.message_type.as_str() {
        "subscribe" => subscription_change(hub, client_id, &parsed, true),
        "unsubscribe" => subscription_change(hub, client_id, &parsed, false),
        "ping" => {
            hub.connections.touch_ping(client_id);
            Some(to_value(PongMessage::new()))
        }
        other => Some(to_value(ErrorMessage::new(
            format!("不支持的消息类型: {other}"),
            None,
        ))),
    }
}

fn subscription_change(
    hub: &WsHub,
    client_id: &str,
    msg: &ClientMessage,
    subscribe: bool,
) -> Option<Value> {
    let Some(kind) = msg
        .subscription_type
        .as_deref()
        .and_then(SubscriptionType::parse)
    else {
        return Some(to_value(ErrorMessage::new(
            "无效的订阅类型",
            msg.subscription_type.clone(),
        )));
    };

    let Some(target) = msg.target.as_deref().filter(|t| !t.is_empty()) else {
        return Some(to_value(ErrorMessage::new("缺少订阅目标", None)));
    };

    let ack = if subscribe {
        let is_new = hub.subscriptions.subscribe(client_id, kind, target);
        SubscriptionAck::subscribed(kind, target, is_new)
    } else {
        let removed = hub.subscriptions.unsubscribe(client_id, kind, target);
        SubscriptionAck::unsubscribed(kind, target, removed)
    };
    Some(to_value(ack))
}

fn to_value<T: serde::Serialize>(message: T) -> Value {
    serde_json::to_value(message).unwrap_or_else(|_| {
        serde_json::json!({ "type": "error", "error": "内部序列化错误" })
    })
}
