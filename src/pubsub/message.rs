use crate::error::{Error, Result};
use crate::network::frame_bytes;
use crate::protocol::RespValue;
use bytes::Bytes;

/// A published message as handed to subscriber callbacks
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: Bytes,
    /// Pattern that matched, for pattern subscriptions
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

impl Message {
    pub fn channel_str(&self) -> String {
        String::from_utf8_lossy(&self.channel).into_owned()
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Frame received on a subscribed connection
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    Message {
        channel: Bytes,
        payload: Bytes,
    },
    PatternMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    Subscribe {
        channel: Bytes,
        count: i64,
    },
    Unsubscribe {
        channel: Option<Bytes>,
        count: i64,
    },
    PSubscribe {
        pattern: Bytes,
        count: i64,
    },
    PUnsubscribe {
        pattern: Option<Bytes>,
        count: i64,
    },
    Pong {
        payload: Option<Bytes>,
    },
}

impl PubSubMessage {
    pub fn from_resp(value: RespValue) -> Result<PubSubMessage> {
        let items = match value {
            RespValue::Array(Some(items)) => items,
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case(b"PONG") => {
                return Ok(PubSubMessage::Pong { payload: None })
            }
            RespValue::Error(message) => return Err(Error::Server(message)),
            other => {
                return Err(Error::corrupt(format!(
                    "pub/sub frame must be an array, got {}",
                    other.kind()
                )))
            }
        };

        let kind = items
            .first()
            .and_then(frame_bytes)
            .ok_or_else(|| Error::corrupt("pub/sub frame without a kind"))?
            .to_ascii_lowercase();

        let bytes_at = |i: usize| -> Result<Bytes> {
            items.get(i).and_then(frame_bytes).cloned().ok_or_else(|| {
                Error::corrupt(format!("pub/sub frame element {} is not a string", i))
            })
        };
        let optional_at = |i: usize| -> Option<Bytes> { items.get(i).and_then(frame_bytes).cloned() };
        let count_at = |i: usize| -> Result<i64> {
            match items.get(i) {
                Some(RespValue::Integer(n)) => Ok(*n),
                _ => Err(Error::corrupt(format!(
                    "pub/sub frame element {} is not an integer",
                    i
                ))),
            }
        };

        match kind.as_slice() {
            b"message" => Ok(PubSubMessage::Message {
                channel: bytes_at(1)?,
                payload: bytes_at(2)?,
            }),
            b"pmessage" => Ok(PubSubMessage::PatternMessage {
                pattern: bytes_at(1)?,
                channel: bytes_at(2)?,
                payload: bytes_at(3)?,
            }),
            b"subscribe" => Ok(PubSubMessage::Subscribe {
                channel: bytes_at(1)?,
                count: count_at(2)?,
            }),
            b"psubscribe" => Ok(PubSubMessage::PSubscribe {
                pattern: bytes_at(1)?,
                count: count_at(2)?,
            }),
            b"unsubscribe" => Ok(PubSubMessage::Unsubscribe {
                channel: optional_at(1),
                count: count_at(2)?,
            }),
            b"punsubscribe" => Ok(PubSubMessage::PUnsubscribe {
                pattern: optional_at(1),
                count: count_at(2)?,
            }),
            b"pong" => Ok(PubSubMessage::Pong {
                payload: optional_at(1),
            }),
            other => Err(Error::corrupt(format!(
                "unknown pub/sub frame kind '{}'",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}
