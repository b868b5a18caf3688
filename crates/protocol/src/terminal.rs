//! Terminal session wire types
//!
//! The terminal backend runs pseudo-terminals server-side; the client only
//! creates them, feeds input, resizes and closes them, and reads frames.

use serde::{Deserialize, Serialize};

/// Frames pushed by the server on a terminal session channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalFrame {
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Data {
        data: String,
    },
    Exit {
        #[serde(default)]
        code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTerminalRequest {
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSession {
    #[serde(rename = "sessionId", alias = "id")]
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalInput {
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}
