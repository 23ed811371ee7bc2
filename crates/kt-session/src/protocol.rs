//! Browser <-> bridge message framing.
//!
//! Every WebSocket text frame carries one JSON object:
//!
//! ```text
//! OP      DIRECTION        FIELDS       DESCRIPTION
//! --------------------------------------------------------------------
//! stdin   browser->bridge  data         keystrokes / paste buffer
//! resize  browser->bridge  rows, cols   new terminal size
//! ping    browser->bridge  -            keep-alive, no effect
//! stdout  bridge->browser  data         output from the process
//! toast   bridge->browser  data         out-of-band notice for the user
//! ```
//!
//! Fields that do not belong to an op decode as zero values and are ignored;
//! encoded frames leave zero-valued fields out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte handed to the exec transport when the input side has ended.
pub const END_OF_TRANSMISSION: u8 = 0x04;

const KNOWN_OPS: [&str; 5] = ["stdin", "stdout", "resize", "toast", "ping"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Message {
    Stdin {
        #[serde(default)]
        data: String,
    },
    Stdout {
        #[serde(default)]
        data: String,
    },
    Resize {
        #[serde(default, skip_serializing_if = "is_zero")]
        rows: u16,
        #[serde(default, skip_serializing_if = "is_zero")]
        cols: u16,
    },
    Toast {
        #[serde(default)]
        data: String,
    },
    Ping,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl Message {
    pub fn op(&self) -> &'static str {
        match self {
            Message::Stdin { .. } => "stdin",
            Message::Stdout { .. } => "stdout",
            Message::Resize { .. } => "resize",
            Message::Toast { .. } => "toast",
            Message::Ping => "ping",
        }
    }

    /// Decode one frame, telling malformed JSON apart from an unknown op.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("op").and_then(|op| op.as_str()) {
            Some(op) if KNOWN_OPS.contains(&op) => Ok(serde_json::from_value(value)?),
            Some(op) => Err(ProtocolError::UnknownOp(op.to_string())),
            None => Err(ProtocolError::MissingOp),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no op")]
    MissingOp,
    #[error("unknown message type '{0}'")]
    UnknownOp(String),
    #[error("message type '{0}' is not accepted from the client")]
    UnexpectedOp(&'static str),
}

/// Terminal dimensions delivered by a `resize` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_stdin() {
        let msg = Message::decode(r#"{"op":"stdin","data":"ls\n"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Stdin {
                data: "ls\n".into()
            }
        );
    }

    #[test]
    fn decode_resize_ignores_data() {
        let msg = Message::decode(r#"{"op":"resize","data":"","rows":24,"cols":80}"#).unwrap();
        assert_eq!(msg, Message::Resize { rows: 24, cols: 80 });
    }

    #[test]
    fn decode_fills_missing_fields_with_zero_values() {
        assert_eq!(
            Message::decode(r#"{"op":"stdin"}"#).unwrap(),
            Message::Stdin {
                data: String::new()
            }
        );
        assert_eq!(
            Message::decode(r#"{"op":"resize","cols":100}"#).unwrap(),
            Message::Resize { rows: 0, cols: 100 }
        );
    }

    #[test]
    fn decode_ping_with_stray_fields() {
        let msg = Message::decode(r#"{"op":"ping","data":"x","rows":1,"cols":2}"#).unwrap();
        assert_eq!(msg, Message::Ping);
    }

    #[test]
    fn decode_unknown_op() {
        let err = Message::decode(r#"{"op":"bind","data":"abc"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownOp(ref op) if op == "bind"));
    }

    #[test]
    fn decode_malformed_json() {
        let err = Message::decode("{\"op\":\"stdin\",").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn decode_missing_op() {
        let err = Message::decode(r#"{"data":"ls"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingOp));
    }

    #[test]
    fn decode_rows_out_of_range() {
        let err = Message::decode(r#"{"op":"resize","rows":70000,"cols":80}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn encode_stdout_omits_unused_fields() {
        let text = Message::Stdout {
            data: "hi\n".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(text, r#"{"op":"stdout","data":"hi\n"}"#);
    }

    #[test]
    fn encode_toast() {
        let text = Message::Toast {
            data: "pod not found".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(text, r#"{"op":"toast","data":"pod not found"}"#);
    }

    #[test]
    fn op_names_match_wire() {
        for msg in [
            Message::Stdin { data: "a".into() },
            Message::Resize { rows: 1, cols: 1 },
            Message::Ping,
        ] {
            let text = msg.encode().unwrap();
            assert!(text.contains(&format!("\"op\":\"{}\"", msg.op())));
        }
    }
}
