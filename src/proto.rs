use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::MediaKind;

pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// One operation carried over a node connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    GetSources,
    GetDirectory {
        path: String,
    },
    GetCollection {
        kind: MediaKind,
        category: Option<String>,
        pattern: String,
    },
    GetFact {
        file_id: i64,
        fact_name: String,
    },
    GetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: u64,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub path: String,
    pub friendly_name: String,
    pub is_file: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaHandle {
    pub file_id: i64,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub version: String,
    pub node_name: String,
    pub port: u16,
    pub supported_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Sources { sources: Vec<Source> },
    Directory { entries: Vec<Entry> },
    Collection { items: Vec<MediaHandle> },
    Fact { value: Option<String> },
    Config { config: ConfigInfo },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: u64,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub enum Receive<T> {
    Receive(T),
    Invalid,
    None,
}

/// Length-prefixed json frame: u32 big endian payload size, then payload.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<BytesMut> {
    let payload = serde_json::to_vec(message)?;

    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_u32_be(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Consumes one complete frame from the buffer if present.
pub fn read_frame<T: DeserializeOwned>(buffer: &mut BytesMut) -> Receive<T> {
    if buffer.len() < 4 {
        return Receive::None;
    }

    let length = ((buffer[0] as usize) << 24)
        | ((buffer[1] as usize) << 16)
        | ((buffer[2] as usize) << 8)
        | (buffer[3] as usize);

    if length > MAX_FRAME_SIZE {
        error!("frame size {} exceeds limit", length);
        return Receive::Invalid;
    }

    if buffer.len() < 4 + length {
        return Receive::None;
    }

    buffer.advance(4);
    let payload = buffer.split_to(length);

    match serde_json::from_slice(&payload) {
        Ok(message) => Receive::Receive(message),
        Err(e) => {
            error!("malformed frame: {}", e);
            Receive::Invalid
        }
    }
}

/// Consumes every complete frame currently buffered. Invalid framing
/// invalidates the whole buffer since the frame boundary is lost.
pub fn read_frames<T: DeserializeOwned>(buffer: &mut BytesMut) -> Receive<Vec<T>> {
    let mut messages = Vec::new();

    loop {
        match read_frame(buffer) {
            Receive::Receive(message) => messages.push(message),
            Receive::Invalid => return Receive::Invalid,
            Receive::None => break,
        }
    }

    if messages.is_empty() {
        Receive::None
    } else {
        Receive::Receive(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let request = Request {
            request_id: 7,
            op: Op::GetFact {
                file_id: 3,
                fact_name: "poster".to_string(),
            },
        };

        let mut buf = encode_frame(&request).unwrap();

        match read_frame::<Request>(&mut buf) {
            Receive::Receive(parsed) => {
                assert_eq!(parsed.request_id, 7);
                match parsed.op {
                    Op::GetFact { file_id, fact_name } => {
                        assert_eq!(file_id, 3);
                        assert_eq!(fact_name, "poster");
                    }
                    _ => panic!("wrong op"),
                }
            }
            _ => panic!("expected a frame"),
        }

        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits() {
        let request = Request {
            request_id: 1,
            op: Op::GetSources,
        };

        let frame = encode_frame(&request).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..frame.len() - 1]);

        match read_frame::<Request>(&mut buf) {
            Receive::None => {}
            _ => panic!("expected to wait for more data"),
        }

        // the buffer is untouched until the frame completes
        assert_eq!(buf.len(), frame.len() - 1);
    }

    #[test]
    fn garbage_payload_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32_be(3);
        buf.extend_from_slice(b"{{{");

        match read_frame::<Request>(&mut buf) {
            Receive::Invalid => {}
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn oversized_frame_is_invalid() {
        let mut buf = BytesMut::new();
        buf.put_u32_be((MAX_FRAME_SIZE + 1) as u32);

        match read_frame::<Request>(&mut buf) {
            Receive::Invalid => {}
            _ => panic!("expected invalid"),
        }
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();

        for request_id in 1..4 {
            let frame = encode_frame(&Request {
                request_id,
                op: Op::GetSources,
            })
            .unwrap();
            buf.extend_from_slice(&frame);
        }

        match read_frames::<Request>(&mut buf) {
            Receive::Receive(messages) => {
                assert_eq!(messages.len(), 3);
                assert_eq!(messages[2].request_id, 3);
            }
            _ => panic!("expected frames"),
        }

        assert!(buf.is_empty());
    }
}
