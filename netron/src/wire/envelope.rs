//! Envelope encoding.
//!
//! Every frame body is a JSON array with fixed positions:
//!
//! ```text
//! [targetFlag, id, dataFlags, actionCode, payload]
//!
//! targetFlag  1 = request (impulse), 0 = reply
//! id          correlation id for requests and replies, stream id otherwise
//! dataFlags   DataFlags bits
//! actionCode  Action
//! payload     action specific, see Payload
//! ```
//!
//! Payloads are decoded into a closed [`Payload`] enum right at the frame
//! boundary; nothing past this module looks at raw JSON.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::definition::{DefId, Definition};
use crate::error::{NetronError, NetronResult, RemoteError};
use crate::value::Value;

/// Action codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Property write or void method call.
    Set = 0,
    /// Property read or method call with result.
    Get = 1,
    /// Keepalive.
    Ping = 2,
    /// Uid and context exchange.
    Handshake = 3,
    /// Announce a context.
    ContextAttach = 4,
    /// Withdraw a context.
    ContextDetach = 5,
    /// Subscribe to a runtime event.
    EventOn = 6,
    /// Cancel an event subscription.
    EventOff = 7,
    /// Deliver a subscribed event.
    EventEmit = 8,
    /// Ask the remote side to open a stream.
    StreamRequest = 16,
    /// Accept a requested stream.
    StreamAccept = 17,
    /// Stream chunk.
    StreamData = 18,
    /// Ask the writer to stop sending.
    StreamPause = 19,
    /// Let the writer send again.
    StreamResume = 20,
    /// Writer side finished.
    StreamEnd = 21,
}

impl TryFrom<u8> for Action {
    type Error = NetronError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Action::Set,
            1 => Action::Get,
            2 => Action::Ping,
            3 => Action::Handshake,
            4 => Action::ContextAttach,
            5 => Action::ContextDetach,
            6 => Action::EventOn,
            7 => Action::EventOff,
            8 => Action::EventEmit,
            16 => Action::StreamRequest,
            17 => Action::StreamAccept,
            18 => Action::StreamData,
            19 => Action::StreamPause,
            20 => Action::StreamResume,
            21 => Action::StreamEnd,
            other => {
                return Err(NetronError::Protocol(format!(
                    "unknown action code {other}"
                )))
            }
        })
    }
}

bitflags! {
    /// Envelope data flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataFlags: u8 {
        /// The sender waits for a reply.
        const REPLY_EXPECTED = 1 << 0;
    }
}

/// Handshake payload, sent by the connecting side and answered in kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Uid of the sending runtime.
    pub uid: Uuid,
    /// Contexts the sender exposes.
    #[serde(default)]
    pub contexts: Vec<(String, Definition)>,
}

/// Action specific payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `[defId, name, value]`
    Set {
        /// Target definition.
        def_id: DefId,
        /// Member name.
        name: String,
        /// Value to write, or call arguments.
        value: Value,
    },
    /// `[defId, name, default]`
    Get {
        /// Target definition.
        def_id: DefId,
        /// Member name.
        name: String,
        /// Default value, or call arguments.
        default: Value,
    },
    /// `null`
    Ping,
    /// Handshake request.
    Handshake(Handshake),
    /// `{id, def}`
    ContextAttach {
        /// Context name.
        ctx_id: String,
        /// Context definition.
        definition: Definition,
    },
    /// Context name.
    ContextDetach {
        /// Context name.
        ctx_id: String,
    },
    /// Event name.
    EventOn {
        /// Event to forward.
        event: String,
    },
    /// Event name.
    EventOff {
        /// Event to stop forwarding.
        event: String,
    },
    /// `[event, ...args]`
    EventEmit {
        /// Event name.
        event: String,
        /// Event arguments.
        args: Vec<Value>,
    },
    /// Stream id of the requester.
    StreamRequest {
        /// Requester's stream id.
        stream_id: u64,
    },
    /// `{origin, remote}`
    StreamAccept {
        /// Requester's stream id.
        origin: u64,
        /// Acceptor's stream id.
        remote: u64,
    },
    /// `[streamId, packetId, bytes]`
    StreamData {
        /// Sender's stream id.
        stream_id: u64,
        /// Per-stream packet sequence, starting at 1.
        packet_id: u64,
        /// Chunk content.
        chunk: Vec<u8>,
    },
    /// Sender's stream id.
    StreamPause {
        /// Sender's stream id.
        stream_id: u64,
    },
    /// Sender's stream id.
    StreamResume {
        /// Sender's stream id.
        stream_id: u64,
    },
    /// `[streamId, packetId]`
    StreamEnd {
        /// Sender's stream id.
        stream_id: u64,
        /// Number of data packets sent on the stream.
        packet_id: u64,
    },
    /// `[errorFlag, value]` answering a request of `action`.
    Reply {
        /// Action being answered.
        action: Action,
        /// Result value, or the error reported by the remote side.
        outcome: Result<Value, RemoteError>,
    },
    /// Handshake answer.
    HandshakeReply(Handshake),
}

impl Payload {
    /// Action code of this payload.
    pub fn action(&self) -> Action {
        match self {
            Payload::Set { .. } => Action::Set,
            Payload::Get { .. } => Action::Get,
            Payload::Ping => Action::Ping,
            Payload::Handshake(_) | Payload::HandshakeReply(_) => Action::Handshake,
            Payload::ContextAttach { .. } => Action::ContextAttach,
            Payload::ContextDetach { .. } => Action::ContextDetach,
            Payload::EventOn { .. } => Action::EventOn,
            Payload::EventOff { .. } => Action::EventOff,
            Payload::EventEmit { .. } => Action::EventEmit,
            Payload::StreamRequest { .. } => Action::StreamRequest,
            Payload::StreamAccept { .. } => Action::StreamAccept,
            Payload::StreamData { .. } => Action::StreamData,
            Payload::StreamPause { .. } => Action::StreamPause,
            Payload::StreamResume { .. } => Action::StreamResume,
            Payload::StreamEnd { .. } => Action::StreamEnd,
            Payload::Reply { action, .. } => *action,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AttachBody {
    id: String,
    def: Definition,
}

#[derive(Serialize, Deserialize)]
struct AcceptBody {
    origin: u64,
    remote: u64,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Correlation id for requests and replies, stream id otherwise.
    pub id: u64,
    /// Data flags.
    pub flags: DataFlags,
    /// Action specific payload.
    pub payload: Payload,
}

impl Envelope {
    /// Request expecting a reply.
    pub fn request(id: u64, payload: Payload) -> Self {
        Self {
            id,
            flags: DataFlags::REPLY_EXPECTED,
            payload,
        }
    }

    /// Message expecting no reply.
    pub fn oneway(id: u64, payload: Payload) -> Self {
        Self {
            id,
            flags: DataFlags::empty(),
            payload,
        }
    }

    /// Reply to request `id`.
    pub fn reply(id: u64, action: Action, outcome: Result<Value, RemoteError>) -> Self {
        Self::oneway(id, Payload::Reply { action, outcome })
    }

    /// Whether this envelope starts an exchange rather than answering one.
    pub fn is_impulse(&self) -> bool {
        !matches!(
            self.payload,
            Payload::Reply { .. } | Payload::HandshakeReply(_)
        )
    }

    /// Whether the sender waits for a reply.
    pub fn expects_reply(&self) -> bool {
        self.flags.contains(DataFlags::REPLY_EXPECTED)
    }

    /// Encode into a frame body.
    pub fn encode(&self) -> NetronResult<Vec<u8>> {
        let payload = match &self.payload {
            Payload::Set {
                def_id,
                name,
                value,
            } => serde_json::to_value((def_id, name, value))?,
            Payload::Get {
                def_id,
                name,
                default,
            } => serde_json::to_value((def_id, name, default))?,
            Payload::Ping => JsonValue::Null,
            Payload::Handshake(handshake) | Payload::HandshakeReply(handshake) => {
                serde_json::to_value(handshake)?
            }
            Payload::ContextAttach { ctx_id, definition } => serde_json::to_value(AttachBody {
                id: ctx_id.clone(),
                def: definition.clone(),
            })?,
            Payload::ContextDetach { ctx_id } => serde_json::to_value(ctx_id)?,
            Payload::EventOn { event } | Payload::EventOff { event } => {
                serde_json::to_value(event)?
            }
            Payload::EventEmit { event, args } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(JsonValue::String(event.clone()));
                for arg in args {
                    items.push(serde_json::to_value(arg)?);
                }
                JsonValue::Array(items)
            }
            Payload::StreamRequest { stream_id }
            | Payload::StreamPause { stream_id }
            | Payload::StreamResume { stream_id } => serde_json::to_value(stream_id)?,
            Payload::StreamAccept { origin, remote } => serde_json::to_value(AcceptBody {
                origin: *origin,
                remote: *remote,
            })?,
            Payload::StreamData {
                stream_id,
                packet_id,
                chunk,
            } => serde_json::to_value((stream_id, packet_id, chunk))?,
            Payload::StreamEnd {
                stream_id,
                packet_id,
            } => serde_json::to_value((stream_id, packet_id))?,
            Payload::Reply { outcome, .. } => match outcome {
                Ok(value) => serde_json::to_value((0u8, value))?,
                Err(error) => serde_json::to_value((1u8, Value::Error(error.clone())))?,
            },
        };

        let body = serde_json::json!([
            u8::from(self.is_impulse()),
            self.id,
            self.flags.bits(),
            self.payload.action() as u8,
            payload
        ]);
        Ok(serde_json::to_vec(&body)?)
    }

    /// Decode a frame body.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for unknown action codes and payloads that do not
    /// match their action.
    pub fn decode(body: &[u8]) -> NetronResult<Self> {
        let (target, id, flags, action, payload): (u8, u64, u8, u8, JsonValue) =
            serde_json::from_slice(body)?;
        let action = Action::try_from(action)?;
        let payload = if target == 0 {
            decode_reply(action, payload)?
        } else {
            decode_request(action, payload)?
        };

        Ok(Self {
            id,
            flags: DataFlags::from_bits_truncate(flags),
            payload,
        })
    }
}

fn decode_request(action: Action, payload: JsonValue) -> NetronResult<Payload> {
    Ok(match action {
        Action::Set => {
            let (def_id, name, value) = serde_json::from_value(payload)?;
            Payload::Set {
                def_id,
                name,
                value,
            }
        }
        Action::Get => {
            let (def_id, name, default) = serde_json::from_value(payload)?;
            Payload::Get {
                def_id,
                name,
                default,
            }
        }
        Action::Ping => Payload::Ping,
        Action::Handshake => Payload::Handshake(serde_json::from_value(payload)?),
        Action::ContextAttach => {
            let body: AttachBody = serde_json::from_value(payload)?;
            Payload::ContextAttach {
                ctx_id: body.id,
                definition: body.def,
            }
        }
        Action::ContextDetach => Payload::ContextDetach {
            ctx_id: serde_json::from_value(payload)?,
        },
        Action::EventOn => Payload::EventOn {
            event: serde_json::from_value(payload)?,
        },
        Action::EventOff => Payload::EventOff {
            event: serde_json::from_value(payload)?,
        },
        Action::EventEmit => {
            let mut items: Vec<JsonValue> = serde_json::from_value(payload)?;
            if items.is_empty() {
                return Err(NetronError::Protocol("event emit without a name".into()));
            }
            let event = serde_json::from_value(items.remove(0))?;
            let args = items
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<_, _>>()?;
            Payload::EventEmit { event, args }
        }
        Action::StreamRequest => Payload::StreamRequest {
            stream_id: serde_json::from_value(payload)?,
        },
        Action::StreamAccept => {
            let body: AcceptBody = serde_json::from_value(payload)?;
            Payload::StreamAccept {
                origin: body.origin,
                remote: body.remote,
            }
        }
        Action::StreamData => {
            let (stream_id, packet_id, chunk) = serde_json::from_value(payload)?;
            Payload::StreamData {
                stream_id,
                packet_id,
                chunk,
            }
        }
        Action::StreamPause => Payload::StreamPause {
            stream_id: serde_json::from_value(payload)?,
        },
        Action::StreamResume => Payload::StreamResume {
            stream_id: serde_json::from_value(payload)?,
        },
        Action::StreamEnd => {
            let (stream_id, packet_id) = serde_json::from_value(payload)?;
            Payload::StreamEnd {
                stream_id,
                packet_id,
            }
        }
    })
}

fn decode_reply(action: Action, payload: JsonValue) -> NetronResult<Payload> {
    if action == Action::Handshake {
        return Ok(Payload::HandshakeReply(serde_json::from_value(payload)?));
    }

    let (error_flag, value): (u8, Value) = serde_json::from_value(payload)?;
    let outcome = match (error_flag, value) {
        (0, value) => Ok(value),
        (_, Value::Error(error)) => Err(error),
        (_, other) => Err(RemoteError::new("Error", format!("{other:?}"))),
    };
    Ok(Payload::Reply { action, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_json(envelope: &Envelope) -> JsonValue {
        serde_json::from_slice(&envelope.encode().expect("encode")).expect("json")
    }

    #[test]
    fn test_positional_layout() {
        let envelope = Envelope::request(
            9,
            Payload::Get {
                def_id: 7,
                name: "add".to_string(),
                default: Value::Null,
            },
        );

        let json = decode_json(&envelope);
        assert_eq!(json[0], 1);
        assert_eq!(json[1], 9);
        assert_eq!(json[2], DataFlags::REPLY_EXPECTED.bits());
        assert_eq!(json[3], Action::Get as u8);
        assert_eq!(json[4][0], 7);
        assert_eq!(json[4][1], "add");
    }

    #[test]
    fn test_reply_error_flag() {
        let envelope = Envelope::reply(
            3,
            Action::Get,
            Err(RemoteError::new("NotExists", "Context not exists")),
        );

        let json = decode_json(&envelope);
        assert_eq!(json[0], 0);
        assert_eq!(json[4][0], 1);

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert!(!decoded.is_impulse());
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_stream_accept_shape() {
        let envelope = Envelope::oneway(
            4,
            Payload::StreamAccept {
                origin: 4,
                remote: 11,
            },
        );

        let json = decode_json(&envelope);
        assert_eq!(json[4]["origin"], 4);
        assert_eq!(json[4]["remote"], 11);
    }

    #[test]
    fn test_handshake_reply_is_not_impulse() {
        let handshake = Handshake {
            uid: Uuid::new_v4(),
            contexts: vec![(
                "calc".to_string(),
                Definition::new(1, "Calculator").with_method("add"),
            )],
        };
        let envelope = Envelope::oneway(1, Payload::HandshakeReply(handshake));

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_event_emit_is_flat() {
        let envelope = Envelope::request(
            2,
            Payload::EventEmit {
                event: "tick".to_string(),
                args: vec![Value::Int(1), Value::from("a")],
            },
        );

        let json = decode_json(&envelope);
        assert_eq!(json[3], 8);
        assert_eq!(
            json[4],
            serde_json::json!([
                "tick",
                {"t": "int", "v": 1},
                {"t": "string", "v": "a"}
            ])
        );

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unknown_action_code() {
        let body = serde_json::to_vec(&serde_json::json!([1, 1, 0, 99, null])).expect("json");
        assert!(matches!(
            Envelope::decode(&body),
            Err(NetronError::Protocol(_))
        ));
    }

    #[test]
    fn test_mismatched_payload() {
        let body =
            serde_json::to_vec(&serde_json::json!([1, 1, 0, Action::StreamEnd as u8, "x"]))
                .expect("json");
        assert!(matches!(
            Envelope::decode(&body),
            Err(NetronError::Protocol(_))
        ));
    }

    #[test]
    fn test_in_memory_handle_cannot_be_encoded() {
        let envelope = Envelope::oneway(
            1,
            Payload::Set {
                def_id: 1,
                name: "x".to_string(),
                value: Value::Interface(crate::interface::Interface::new(
                    Definition::new(1, "Remote"),
                    crate::peer::Peer::new(NoTransport, Default::default()),
                )),
            },
        );
        assert!(matches!(envelope.encode(), Err(NetronError::Protocol(_))));
    }

    struct NoTransport;

    #[async_trait::async_trait(?Send)]
    impl crate::transport::Transport for NoTransport {}
}
