//! Newline-delimited JSON codec.
//!
//! A frame is one line holding exactly one JSON object. Decoding checks the
//! envelope shape by hand instead of relying on an untagged serde enum, so a
//! bad frame can still report the id it carried.

use crate::error::ProtocolError;
use crate::protocol::types::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId,
};
use serde_json::{Map, Value};

/// A frame that could not be turned into a [`Message`].
#[derive(Debug)]
pub struct DecodeError {
    /// The request id, when the frame was an object with a usable `id`.
    pub id: Option<RequestId>,
    pub error: ProtocolError,
}

impl DecodeError {
    fn new(id: Option<RequestId>, error: ProtocolError) -> Self {
        Self { id, error }
    }

    /// Builds the message reporting this failure to the caller: an error
    /// response when an id was salvaged, an `error` notification otherwise.
    pub fn report(&self) -> Message {
        match &self.id {
            Some(id) => {
                JsonRpcResponse::error(Some(id.clone()), JsonRpcError::from(&self.error)).into()
            }
            None => JsonRpcNotification::error_with_code(self.error.code(), self.error.to_string())
                .into(),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for DecodeError {}

/// Decodes one frame (without its trailing newline).
pub fn decode(line: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| DecodeError::new(None, ProtocolError::ParseError(e.to_string().into())))?;

    let Value::Object(mut map) = value else {
        return Err(DecodeError::new(
            None,
            ProtocolError::InvalidRequest("expected a JSON object".into()),
        ));
    };

    let id = decode_id(&mut map)?;

    if let Some(method) = map.remove("method") {
        let Value::String(method) = method else {
            return Err(DecodeError::new(
                id.flatten(),
                ProtocolError::InvalidRequest("method must be a string".into()),
            ));
        };
        let params = map.remove("params");

        return Ok(match id {
            Some(id) => Message::Request(JsonRpcRequest {
                jsonrpc: JSONRPC_VERSION.into(),
                id,
                method,
                params,
            }),
            None => Message::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.into(),
                method,
                params,
            }),
        });
    }

    let result = map.remove("result");
    let error = map.remove("error");
    if result.is_none() && error.is_none() {
        return Err(DecodeError::new(
            id.flatten(),
            ProtocolError::InvalidRequest("missing method".into()),
        ));
    }

    let Some(id) = id else {
        return Err(DecodeError::new(
            None,
            ProtocolError::InvalidRequest("response without id".into()),
        ));
    };

    let error = match (result.is_some(), error) {
        (true, Some(_)) => {
            return Err(DecodeError::new(
                id,
                ProtocolError::InvalidRequest("response has both result and error".into()),
            ));
        }
        (_, Some(error)) => Some(serde_json::from_value::<JsonRpcError>(error).map_err(|e| {
            DecodeError::new(
                id.clone(),
                ProtocolError::InvalidRequest(format!("malformed error object: {e}").into()),
            )
        })?),
        (_, None) => None,
    };

    Ok(Message::Response(JsonRpcResponse {
        jsonrpc: JSONRPC_VERSION.into(),
        id,
        result,
        error,
    }))
}

/// Reads the `id` member.
///
/// `None` means the member was absent, `Some(None)` an explicit `null`.
fn decode_id(map: &mut Map<String, Value>) -> Result<Option<Option<RequestId>>, DecodeError> {
    match map.remove("id") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(raw) => serde_json::from_value::<RequestId>(raw)
            .map(|id| Some(Some(id)))
            .map_err(|_| {
                DecodeError::new(
                    None,
                    ProtocolError::InvalidRequest("id must be a string or an integer".into()),
                )
            }),
    }
}

/// Encodes a message as a single line, without the trailing newline.
pub fn encode(message: &Message) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: Message) {
        let line = encode(&message).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(decode(&line).unwrap(), message);
    }

    #[test]
    fn test_round_trip_all_kinds() {
        round_trip(
            JsonRpcRequest::new("start")
                .with_id(1)
                .with_params(json!({"duration": 5}))
                .into(),
        );
        round_trip(JsonRpcRequest::new("getStatus").with_id("abc").into());
        round_trip(JsonRpcRequest::new("reset").into());
        round_trip(JsonRpcResponse::success(Some(9_007_199_254_740_991.into()), json!(null)).into());
        round_trip(
            JsonRpcResponse::error(Some("x".into()), JsonRpcError::from(&ProtocolError::MethodNotFound("nope".into()))).into(),
        );
        round_trip(
            JsonRpcNotification::event(
                "monitor_data",
                json!({"data": {"cpu": {"per_core": [1.5, 2.0]}, "note": "line\nbreak"}}),
            )
            .into(),
        );
    }

    #[test]
    fn test_request_without_jsonrpc_member() {
        let message = decode(r#"{"id":1,"method":"start","params":{"duration":5}}"#).unwrap();
        let Message::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, Some(RequestId::Number(1)));
        assert_eq!(request.params, Some(json!({"duration": 5})));
    }

    #[test]
    fn test_missing_id_is_notification() {
        let message = decode(r#"{"jsonrpc":"2.0","method":"pause"}"#).unwrap();
        assert!(matches!(message, Message::Notification(n) if n.method == "pause"));
    }

    #[test]
    fn test_null_id_is_idless_request() {
        let message = decode(r#"{"jsonrpc":"2.0","id":null,"method":"pause"}"#).unwrap();
        assert!(matches!(message, Message::Request(r) if r.id.is_none()));
    }

    #[test]
    fn test_malformed_json_reports_notification() {
        let err = decode("not json").unwrap_err();
        assert!(err.id.is_none());
        assert_eq!(err.error.code(), -32700);
        let Message::Notification(report) = err.report() else {
            panic!("expected notification");
        };
        assert_eq!(report.method, "error");
        assert_eq!(report.params.unwrap()["code"], -32700);
    }

    #[test]
    fn test_shape_error_salvages_id() {
        let err = decode(r#"{"id":3,"params":{}}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::Number(3)));
        let Message::Response(report) = err.report() else {
            panic!("expected response");
        };
        assert_eq!(report.id, Some(RequestId::Number(3)));
        assert_eq!(report.error.unwrap().code, -32600);
    }

    #[test]
    fn test_non_string_method_rejected() {
        let err = decode(r#"{"id":"a","method":42}"#).unwrap_err();
        assert_eq!(err.id, Some(RequestId::String("a".into())));
    }

    #[test]
    fn test_response_shapes() {
        assert!(decode(r#"{"result":{}}"#).is_err());
        assert!(decode(r#"{"id":1,"result":{},"error":{"code":1,"message":"x"}}"#).is_err());
        assert!(decode(r#"{"id":1,"error":{"message":"x"}}"#).is_err());
        assert!(matches!(
            decode(r#"{"id":1,"error":{"code":-32000,"message":"x"}}"#),
            Ok(Message::Response(_))
        ));
    }

    #[test]
    fn test_non_object_and_bad_id() {
        assert!(decode("[1,2]").is_err());
        assert!(decode(r#"{"id":1.5,"method":"x"}"#).is_err());
    }
}
