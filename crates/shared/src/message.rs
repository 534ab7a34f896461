use crate::error::ErrorKind;

/// Wire schema version declared in the `hello` event.
pub const PROTOCOL_VERSION: u8 = 1;

/// One unit exchanged with the host. Maps 1:1 to a frame.
///
/// `payload` is an opaque postcard blob whose shape is determined by
/// `operation` (see [`crate::ops`]). Decoding the payload is the
/// receiver's job; an undecodable payload for a known operation is a
/// per-request `Malformed` error, not a session fault.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    /// Chosen by the originator of the exchange, echoed verbatim on
    /// responses and progress events.
    pub correlation_id: u64,
    pub kind: Kind,
    /// Handler family tag, e.g. `execute` or `telemetry_report`. Kept as a
    /// string so an unknown tag still decodes and can be answered with
    /// `UnsupportedOperation` instead of killing the session.
    pub operation: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Kind {
    Request,
    Response { status: Status },
    Event,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Status {
    Ok,
    Err { kind: ErrorKind, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] postcard::Error),
}

impl Message {
    pub fn request(correlation_id: u64, operation: impl Into<String>, payload: Vec<u8>) -> Self {
        Message {
            correlation_id,
            kind: Kind::Request,
            operation: operation.into(),
            payload,
        }
    }

    pub fn response_ok(
        correlation_id: u64,
        operation: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Message {
            correlation_id,
            kind: Kind::Response { status: Status::Ok },
            operation: operation.into(),
            payload,
        }
    }

    pub fn response_err(
        correlation_id: u64,
        operation: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Message {
            correlation_id,
            kind: Kind::Response {
                status: Status::Err {
                    kind,
                    message: message.into(),
                },
            },
            operation: operation.into(),
            payload: Vec::new(),
        }
    }

    pub fn event(correlation_id: u64, operation: impl Into<String>, payload: Vec<u8>) -> Self {
        Message {
            correlation_id,
            kind: Kind::Event,
            operation: operation.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request() {
        let msg = Message::request(7, "execute", vec![1, 2, 3]);
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_an_error_response() {
        let msg = Message::response_err(9, "file_read", ErrorKind::NotFound, "no such file");
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.correlation_id, 9);
        match decoded.kind {
            Kind::Response {
                status: Status::Err { kind, message },
            } => {
                assert_eq!(kind, ErrorKind::NotFound);
                assert_eq!(message, "no such file");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn unknown_operation_tags_still_decode() {
        // The envelope must survive operations this build has never heard
        // of so the dispatcher can answer UnsupportedOperation.
        let msg = Message::request(9, "moonshot", Vec::new());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.operation, "moonshot");
        assert_eq!(decoded.kind, Kind::Request);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(Message::decode(&[0xff; 3]).is_err());
    }
}
