use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stp_frame::{Frame, Status};

use crate::error::{Result, ScopeError};

/// A typed command: the service it belongs to and its numeric id.
///
/// Service façades implement this for their command enums so call sites
/// never spell out raw ids.
pub trait Message {
    /// Numeric command id within the service.
    fn id(&self) -> u32;

    /// Name of the service the command is addressed to.
    fn service_name(&self) -> &'static str;
}

/// The body of a successful (status OK) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Service that answered.
    pub service: String,
    /// Command id echoed by the browser.
    pub command_id: u32,
    /// Tag the response was correlated by.
    pub tag: u32,
    /// Raw payload.
    pub payload: Bytes,
}

impl Response {
    /// Turn a correlated response frame into a `Response`, mapping error
    /// status into [`ScopeError::Remote`].
    pub(crate) fn from_frame(frame: Frame) -> Result<Self> {
        match frame.status {
            Status::Ok => Ok(Self {
                service: frame.service,
                command_id: frame.command_id,
                tag: frame.tag,
                payload: frame.payload,
            }),
            Status::Error => Err(ScopeError::Remote {
                detail: remote_detail(&frame.payload),
                service: frame.service,
                command_id: frame.command_id,
            }),
            other => Err(ScopeError::Disconnected(format!(
                "unexpected {other} frame routed as a response"
            ))),
        }
    }

    /// Decode the JSON payload. An empty payload decodes as JSON `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }

    /// Returns true if the browser sent no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Error body the browser sends with status ERROR.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ErrorInfo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Serialize a request body.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.is_empty() {
        return Ok(serde_json::from_slice(b"null")?);
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Human-readable detail for an error payload: the JSON `description` when
/// present, otherwise the payload as text.
pub(crate) fn remote_detail(payload: &[u8]) -> String {
    match serde_json::from_slice::<ErrorInfo>(payload) {
        Ok(info) if !info.description.is_empty() => info.description,
        _ if payload.is_empty() => "no error detail".to_string(),
        _ => String::from_utf8_lossy(payload).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_frame_becomes_response() {
        let frame = Frame::new("prefs", 1, 7, Status::Ok, r#"{"value":"on"}"#);
        let response = Response::from_frame(frame).unwrap();
        assert_eq!(response.tag, 7);

        #[derive(Deserialize)]
        struct Value {
            value: String,
        }
        assert_eq!(response.decode::<Value>().unwrap().value, "on");
    }

    #[test]
    fn error_frame_uses_json_description() {
        let frame = Frame::new(
            "exec",
            1,
            3,
            Status::Error,
            r#"{"description":"no such window","line":4}"#,
        );
        let err = Response::from_frame(frame).unwrap_err();
        match err {
            ScopeError::Remote {
                service,
                command_id,
                detail,
            } => {
                assert_eq!(service, "exec");
                assert_eq!(command_id, 1);
                assert_eq!(detail, "no such window");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_frame_falls_back_to_text() {
        let frame = Frame::new("exec", 1, 3, Status::Error, "plain failure");
        let err = Response::from_frame(frame).unwrap_err();
        assert!(matches!(err, ScopeError::Remote { detail, .. } if detail == "plain failure"));
    }

    #[test]
    fn empty_payload_decodes_as_null() {
        let frame = Frame::new("exec", 1, 3, Status::Ok, "");
        let response = Response::from_frame(frame).unwrap();
        response.decode::<()>().unwrap();
        assert_eq!(response.decode::<Option<u32>>().unwrap(), None);
    }

    #[test]
    fn encode_payload_is_json() {
        let bytes = encode_payload(&serde_json::json!({"name": "exec"})).unwrap();
        assert_eq!(bytes.as_ref(), br#"{"name":"exec"}"#);
    }
}
