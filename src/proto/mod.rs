//! Messages exchanged between clients and the server.
//!
//! Every frame on the wire carries one JSON object. Objects with a `msg_type` field decode
//! into the tagged variants of [`Message`]; interactive replies have no `msg_type` and are
//! recognized by their `value` field instead (see [`codec`]).

pub mod codec;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use strum_macros::{Display as StrumDisplay, EnumString};

/// What a client wants to receive.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClientKind {
    /// Output of an arbitrary debugger command.
    Cmd,
    /// Register values and the next instruction.
    Register,
    /// Disassembly around the program counter.
    Disasm,
    /// Raw stack bytes and the stack pointer.
    Stack,
    /// Backtrace text.
    #[serde(rename = "bt")]
    #[strum(to_string = "bt", serialize = "backtrace")]
    Backtrace,
    /// Synchronous queries, plus a stop notification.
    Interactive,
    /// Generic passive view, fed by proxy push updates only.
    View,
}

/// When a client wants to receive updates.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOn {
    /// On every debugger stop.
    #[default]
    Stop,
    /// Never from the debugger itself, only from proxy push updates.
    Manual,
}

/// Client registration, sent once right after connecting.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(rename = "type")]
    pub kind: ClientKind,
    #[serde(default)]
    pub update_on: UpdateOn,
    /// Debugger command executed on each update, `cmd` kind only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl ClientConfig {
    pub fn new(kind: ClientKind) -> Self {
        Self {
            kind,
            update_on: UpdateOn::Stop,
            command: None,
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::new(ClientKind::Cmd)
        }
    }

    pub fn with_update_on(self, update_on: UpdateOn) -> Self {
        Self { update_on, ..self }
    }
}

impl Display for ClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref command) = self.command {
            write!(f, " `{command}`")?;
        }
        match self.update_on {
            UpdateOn::Stop => write!(f, " (update on stop)"),
            UpdateOn::Manual => write!(f, " (push only)"),
        }
    }
}

/// Register value as reported by a debugger: a number, or a sentinel like `n/a`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Int(u64),
    Text(String),
}

impl RegisterValue {
    pub const NOT_AVAILABLE: &'static str = "n/a";

    pub fn not_available() -> Self {
        RegisterValue::Text(Self::NOT_AVAILABLE.to_string())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegisterValue::Int(v) => Some(*v),
            RegisterValue::Text(_) => None,
        }
    }
}

impl From<u64> for RegisterValue {
    fn from(value: u64) -> Self {
        RegisterValue::Int(value)
    }
}

/// Update payload, its shape depends on the kind of the receiving client.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateData {
    Registers {
        regs: BTreeMap<String, RegisterValue>,
        next_instruction: Option<String>,
    },
    Stack {
        data: Vec<u8>,
        sp: u64,
    },
    Disasm {
        disassembly: String,
    },
    Backtrace {
        backtrace: String,
    },
    Command {
        output: String,
    },
    Stopped {
        pc: u64,
    },
    /// Relayed proxy payload, or any other shape unknown to this crate, kept as is.
    Raw(serde_json::Value),
}

/// Interactive request, answered by a single [`Response`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    GetRegister { register: String },
    GetMemory { start: u64, end: u64 },
}

/// Answer value of a [`Query`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Register(RegisterValue),
    Memory(Vec<u8>),
}

/// Interactive reply. `value` is `None` when the query can't be satisfied.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Response {
    pub value: Option<QueryValue>,
}

/// Unit of exchange between clients and the server.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Message {
    /// client -> server, first message on a connection.
    Register { config: ClientConfig },
    /// server -> client, asynchronous update.
    Update {
        arch: Option<String>,
        data: UpdateData,
    },
    /// proxy -> server, relay `data` to every client of `update_type` kind. `data` is never
    /// interpreted by the server.
    PushUpdate {
        update_type: ClientKind,
        data: serde_json::Value,
    },
    /// client -> server, synchronous query.
    Interactive(Query),
    /// server -> client, reply to an [`Message::Interactive`]. Encoded without `msg_type`.
    #[serde(skip)]
    Response(Response),
    /// server -> proxy, acknowledges a [`Message::PushUpdate`].
    Ack,
}

impl Message {
    /// True for messages that answer a synchronous query.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Update { .. } => "update",
            Message::PushUpdate { .. } => "push_update",
            Message::Interactive(_) => "interactive",
            Message::Response(_) => "response",
            Message::Ack => "ack",
        }
    }
}
