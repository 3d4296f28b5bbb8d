use std::time::Duration;

use axum::http::StatusCode;
use log::debug;
use serde_json::{Value, json};

use crate::circuit::{Circuit, Dequeued};
use crate::net::Message;

/// Length of one bounded dequeue inside a long poll.
pub const EVENT_POLL_WAIT: Duration = Duration::from_secs(1);

/// Body for an outbox message, or `None` when the kind has no translation.
pub fn translate_event(message: &Message) -> Option<Value> {
    match message {
        Message::ScriptRunningReply {
            object_id,
            item_id,
            running,
            mono,
        } => Some(json!({
            "Script": [{
                "ObjectID": object_id,
                "ItemID": item_id,
                "Running": running,
                "Mono": mono,
            }]
        })),
        Message::TeleportFinish { .. }
        | Message::CrossedRegion { .. }
        | Message::EnableSimulator { .. }
        | Message::EstablishAgentCommunication { .. } => Some(json!({})),
        _ => None,
    }
}

/// One EventQueueGet long poll. Disabled delivery is 404; an empty window or
/// an untranslatable message is 502.
pub async fn poll_events(circuit: &Circuit, wait: Duration) -> Result<Value, StatusCode> {
    let attempts = circuit.config().long_poll_attempts;

    match circuit.events().dequeue(attempts, wait).await {
        Dequeued::Event { id, message } => {
            let name = message.kind().name();
            match translate_event(&message) {
                Some(body) => Ok(json!({
                    "id": id,
                    "message": name,
                    "body": body,
                })),
                None => {
                    debug!(
                        "circuit {} has no event queue translation for {}",
                        circuit.code(),
                        name
                    );
                    Err(StatusCode::BAD_GATEWAY)
                }
            }
        }
        Dequeued::Disabled => Err(StatusCode::NOT_FOUND),
        Dequeued::TimedOut => Err(StatusCode::BAD_GATEWAY),
    }
}
