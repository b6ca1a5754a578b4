// src/bus/mod.rs
//
// Message-bus plumbing: the framed wire codec, the socket client, and the
// listener/dispatcher pair that turns inbound bus traffic into work items.
//
// The bus speaks a method-oriented protocol: every frame is a fixed-size
// metadata header (six big-endian u32 field lengths) followed by the
// method, uri, replyto, process name, username and body bytes.

pub mod client;
pub mod codec;
pub mod listener;

use thiserror::Error;

// ============================================================================
// Types
// ============================================================================

/// Bus method verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Set,
    Get,
    Pub,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Set => "set",
            Method::Get => "get",
            Method::Pub => "pub",
            Method::Post => "post",
        }
    }

    pub fn from_str(s: &str) -> Option<Method> {
        match s {
            "set" => Some(Method::Set),
            "get" => Some(Method::Get),
            "pub" => Some(Method::Pub),
            "post" => Some(Method::Post),
            _ => None,
        }
    }
}

/// One bus message, either direction.
#[derive(Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub method: Method,
    pub uri: String,
    pub replyto: Option<String>,
    pub process_name: String,
    pub username: String,
    /// JSON text; empty for body-less messages.
    pub body: String,
}

impl BusMessage {
    pub fn new(method: Method, uri: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            replyto: None,
            process_name: String::new(),
            username: String::new(),
            body: body.into(),
        }
    }

    pub fn with_replyto(mut self, replyto: impl Into<String>) -> Self {
        self.replyto = Some(replyto.into());
        self
    }

    /// Parse the body as JSON.
    pub fn body_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("malformed bus frame: {0}")]
    Malformed(String),
    #[error("bus connection closed")]
    Closed,
}
