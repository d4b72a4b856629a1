use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag stored in the first byte of every replicated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    Set = 0,
}

impl TryFrom<u8> for RequestType {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RequestType::Set),
            other => Err(StoreError::UnknownRequestType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set(SetRequest),
}

impl Command {
    pub fn set(key: &[u8], value: &[u8]) -> Self {
        Command::Set(SetRequest {
            key: key.to_vec(),
            value: value.to_vec(),
        })
    }

    pub fn request_type(&self) -> RequestType {
        match self {
            Command::Set(_) => RequestType::Set,
        }
    }

    pub fn encode(&self) -> Result<LogEntry> {
        let mut buf = vec![self.request_type() as u8];
        match self {
            Command::Set(req) => bincode::serialize_into(&mut buf, req)?,
        }
        Ok(LogEntry(buf))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (tag, payload) = buf
            .split_first()
            .ok_or_else(|| StoreError::Codec("empty log entry".to_string()))?;
        match RequestType::try_from(*tag)? {
            RequestType::Set => Ok(Command::Set(bincode::deserialize(payload)?)),
        }
    }
}

/// Opaque replicated operation: `[request type][payload]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogEntry(pub Vec<u8>);

impl LogEntry {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn decode(&self) -> Result<Command> {
        Command::decode(&self.0)
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(tag) => write!(f, "entry(type={}, {} bytes)", tag, self.0.len()),
            None => write!(f, "entry(empty)"),
        }
    }
}

/// Outcome handed back to the writer once the entry is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApplyResult {
    pub error: Option<String>,
}

impl ApplyResult {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.error {
            None => Ok(()),
            Some(msg) => Err(StoreError::Apply(msg)),
        }
    }
}

impl fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            None => write!(f, "ok"),
            Some(e) => write!(f, "error: {}", e),
        }
    }
}
