//! Single encode/decode boundary for [`Message`].

use crate::proto::{Message, Response};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has neither `msg_type` nor `value` field")]
    UnknownShape,
}

const TYPE_FIELD: &str = "msg_type";
const VALUE_FIELD: &str = "value";

/// Serialize a message into a frame body.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body = match message {
        Message::Response(response) => serde_json::to_vec(response)?,
        other => serde_json::to_vec(other)?,
    };
    Ok(body)
}

/// Deserialize a frame body.
///
/// Tagged messages are told apart by `msg_type`, interactive replies by the presence of
/// a `value` field.
pub fn decode(body: &[u8]) -> Result<Message, CodecError> {
    let raw: Value = serde_json::from_slice(body)?;
    let Value::Object(ref fields) = raw else {
        return Err(CodecError::UnknownShape);
    };

    if fields.contains_key(TYPE_FIELD) {
        Ok(serde_json::from_value(raw)?)
    } else if fields.contains_key(VALUE_FIELD) {
        let response: Response = serde_json::from_value(raw)?;
        Ok(Message::Response(response))
    } else {
        Err(CodecError::UnknownShape)
    }
}
