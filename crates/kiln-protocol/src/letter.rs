use crate::ProtocolError;
use crate::codec::{self, BINARY_MARKER};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Wire names accepted in the `type` field of a JSON letter.
const JSON_TYPES: &[&str] = &[
    "new",
    "menu",
    "post",
    "command",
    "cmdResponse",
    "cancel",
    "response",
    "notify",
    "log",
    "logRegister",
    "heartbeat",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Letter {
    #[serde(rename = "new")]
    NewTask(NewTask),
    #[serde(rename = "menu")]
    Menu(MenuLetter),
    #[serde(rename = "post")]
    Post(PostLetter),
    #[serde(rename = "command")]
    Command(CommandLetter),
    #[serde(rename = "cmdResponse")]
    CmdResponse(CmdResponse),
    #[serde(rename = "cancel")]
    Cancel(Cancel),
    #[serde(rename = "response")]
    Response(Response),
    #[serde(rename = "notify")]
    PropertyNotify(PropertyNotify),
    #[serde(rename = "log")]
    Log(LogLetter),
    #[serde(rename = "logRegister")]
    LogRegister(LogRegister),
    #[serde(rename = "heartbeat")]
    Heartbeat(Heartbeat),
    #[serde(skip)]
    BinaryFile(BinaryFile),
}

impl Letter {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewTask(_) => "new",
            Self::Menu(_) => "menu",
            Self::Post(_) => "post",
            Self::Command(_) => "command",
            Self::CmdResponse(_) => "cmdResponse",
            Self::Cancel(_) => "cancel",
            Self::Response(_) => "response",
            Self::PropertyNotify(_) => "notify",
            Self::Log(_) => "log",
            Self::LogRegister(_) => "logRegister",
            Self::Heartbeat(_) => "heartbeat",
            Self::BinaryFile(_) => "binary",
        }
    }

    /// Checks that every key the receiving handler depends on is present.
    pub fn validity(&self) -> bool {
        match self {
            Self::NewTask(l) => {
                !l.header.tid.is_empty() && !l.content.sn.is_empty() && !l.content.vsn.is_empty()
            }
            Self::Menu(l) => !l.header.mid.is_empty() && !l.header.version.is_empty(),
            Self::Post(l) => {
                !l.header.ident.is_empty()
                    && !l.header.version.is_empty()
                    && !l.header.output.is_empty()
            }
            Self::Command(l) => !l.header.kind.is_empty(),
            Self::CmdResponse(l) => !l.header.ident.is_empty() && !l.header.kind.is_empty(),
            Self::Cancel(l) => !l.header.tid.is_empty(),
            Self::Response(l) => !l.header.ident.is_empty() && !l.header.tid.is_empty(),
            Self::PropertyNotify(l) => !l.header.ident.is_empty() && l.content.max > 0,
            Self::Log(l) => !l.header.log_id.is_empty() && !l.content.log_msg.is_empty(),
            Self::LogRegister(l) => !l.header.log_id.is_empty(),
            Self::Heartbeat(l) => !l.header.ident.is_empty(),
            Self::BinaryFile(l) => !l.tid.is_empty(),
        }
    }

    /// Identity of the sender for letters that carry one.
    pub fn ident(&self) -> Option<&str> {
        match self {
            Self::CmdResponse(l) => Some(&l.header.ident),
            Self::Response(l) => Some(&l.header.ident),
            Self::PropertyNotify(l) => Some(&l.header.ident),
            Self::Log(l) => Some(&l.header.ident),
            Self::LogRegister(l) => Some(&l.header.ident),
            Self::Heartbeat(l) => Some(&l.header.ident),
            _ => None,
        }
    }

    /// Parses one complete frame, length prefix included.
    pub fn parse(frame: &[u8]) -> Result<Letter, ProtocolError> {
        if frame.len() < 2 {
            return Err(ProtocolError::Malformed(format!(
                "frame of {} bytes has no prefix",
                frame.len()
            )));
        }

        let prefix = u16::from_be_bytes([frame[0], frame[1]]);
        if prefix == BINARY_MARKER {
            return codec::decode_binary(frame).map(Letter::BinaryFile);
        }

        let body = &frame[2..];
        if body.len() != prefix as usize {
            return Err(ProtocolError::Malformed(format!(
                "declared length {prefix} but frame carries {} bytes",
                body.len()
            )));
        }

        let value: Value =
            serde_json::from_slice(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(ProtocolError::Malformed("missing type".to_string()));
        };
        if !JSON_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_bytes_with_length(&self) -> Result<Bytes, ProtocolError> {
        if let Self::BinaryFile(binary) = self {
            return codec::encode_binary(binary);
        }

        let body = serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Ok(len) = u16::try_from(body.len()) else {
            return Err(ProtocolError::TooLarge(body.len()));
        };
        if len == BINARY_MARKER {
            return Err(ProtocolError::Malformed(
                "json letter collides with binary marker".to_string(),
            ));
        }

        let mut out = BytesMut::with_capacity(body.len() + 2);
        out.put_u16(len);
        out.put_slice(&body);
        Ok(out.freeze())
    }
}

macro_rules! into_letter {
    ($($ty:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Letter {
                fn from(letter: $ty) -> Self {
                    Letter::$variant(letter)
                }
            }
        )*
    };
}

into_letter! {
    NewTask => NewTask,
    MenuLetter => Menu,
    PostLetter => Post,
    CommandLetter => Command,
    CmdResponse => CmdResponse,
    Cancel => Cancel,
    Response => Response,
    PropertyNotify => PropertyNotify,
    LogLetter => Log,
    LogRegister => LogRegister,
    Heartbeat => Heartbeat,
    BinaryFile => BinaryFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoContent {}

// NewTask

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTaskHeader {
    pub tid: String,
    pub parent: String,
    #[serde(rename = "needPost")]
    pub need_post: String,
    pub menu: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOrder {
    #[serde(rename = "resultPath")]
    pub result_path: String,
    pub cmds: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewTaskContent {
    pub sn: String,
    pub vsn: String,
    pub datetime: String,
    pub extra: BuildOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub header: NewTaskHeader,
    #[serde(default)]
    pub content: NewTaskContent,
}

impl NewTask {
    pub fn new(tid: impl Into<String>, sn: impl Into<String>, vsn: impl Into<String>) -> Self {
        Self {
            header: NewTaskHeader {
                tid: tid.into(),
                need_post: "false".to_string(),
                ..NewTaskHeader::default()
            },
            content: NewTaskContent {
                sn: sn.into(),
                vsn: vsn.into(),
                ..NewTaskContent::default()
            },
        }
    }

    pub fn tid(&self) -> &str {
        &self.header.tid
    }

    pub fn need_post(&self) -> bool {
        self.header.need_post == "true"
    }

    pub fn parent(&self) -> Option<&str> {
        non_empty(&self.header.parent)
    }
}

// Menu

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuHeader {
    pub mid: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MenuContent {
    pub cmds: Vec<String>,
    pub depends: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuLetter {
    #[serde(default)]
    pub header: MenuHeader,
    #[serde(default)]
    pub content: MenuContent,
}

impl MenuLetter {
    pub fn new(
        mid: impl Into<String>,
        version: impl Into<String>,
        cmds: Vec<String>,
        depends: Vec<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            header: MenuHeader {
                mid: mid.into(),
                version: version.into(),
            },
            content: MenuContent {
                cmds,
                depends,
                output: output.into(),
            },
        }
    }
}

// Post

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostHeader {
    pub ident: String,
    pub version: String,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostContent {
    pub cmds: Vec<String>,
    #[serde(rename = "Menus")]
    pub menus: BTreeMap<String, MenuLetter>,
    #[serde(rename = "Fragments")]
    pub frags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostLetter {
    #[serde(default)]
    pub header: PostHeader,
    #[serde(default)]
    pub content: PostContent,
}

// Command

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub extra: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandLetter {
    #[serde(default)]
    pub header: CommandHeader,
    #[serde(default)]
    pub content: BTreeMap<String, Value>,
}

// CmdResponse

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdState {
    #[serde(rename = "s")]
    Success,
    #[serde(rename = "f")]
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdResponseHeader {
    #[serde(default)]
    pub ident: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub state: CmdState,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmdResponseContent {
    pub reason: String,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdResponse {
    pub header: CmdResponseHeader,
    #[serde(default)]
    pub content: CmdResponseContent,
}

impl CmdResponse {
    pub fn new(ident: impl Into<String>, kind: impl Into<String>, state: CmdState) -> Self {
        Self {
            header: CmdResponseHeader {
                ident: ident.into(),
                kind: kind.into(),
                state,
                target: String::new(),
            },
            content: CmdResponseContent::default(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.content.reason = reason.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.content.extra.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.header.state == CmdState::Success
    }
}

// Cancel

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelHeader {
    pub tid: String,
    pub parent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancel {
    #[serde(default)]
    pub header: CancelHeader,
    #[serde(default)]
    pub content: NoContent,
}

impl Cancel {
    pub fn new(tid: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            header: CancelHeader {
                tid: tid.into(),
                parent: parent.unwrap_or_default().to_string(),
            },
            content: NoContent {},
        }
    }
}

// Response

/// Task progress codes carried by `Response` letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseState {
    #[serde(rename = "0")]
    Prepare,
    #[serde(rename = "1")]
    InProc,
    #[serde(rename = "2")]
    Finished,
    #[serde(rename = "3")]
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseHeader {
    pub ident: String,
    pub tid: String,
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseContent {
    pub state: ResponseState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub header: ResponseHeader,
    pub content: ResponseContent,
}

impl Response {
    pub fn new(
        ident: impl Into<String>,
        tid: impl Into<String>,
        parent: Option<&str>,
        state: ResponseState,
    ) -> Self {
        Self {
            header: ResponseHeader {
                ident: ident.into(),
                tid: tid.into(),
                parent: parent.unwrap_or_default().to_string(),
            },
            content: ResponseContent { state },
        }
    }

    pub fn state(&self) -> ResponseState {
        self.content.state
    }
}

// PropertyNotify

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentHeader {
    pub ident: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyContent {
    #[serde(rename = "MAX")]
    pub max: usize,
    #[serde(rename = "PROC")]
    pub proc: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyNotify {
    #[serde(default)]
    pub header: IdentHeader,
    #[serde(default)]
    pub content: PropertyContent,
}

impl PropertyNotify {
    pub fn new(ident: impl Into<String>, max: usize, proc: usize) -> Self {
        Self {
            header: IdentHeader {
                ident: ident.into(),
            },
            content: PropertyContent { max, proc },
        }
    }
}

// Log

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogHeader {
    pub ident: String,
    #[serde(rename = "logId")]
    pub log_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogContent {
    #[serde(rename = "logMsg")]
    pub log_msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLetter {
    #[serde(default)]
    pub header: LogHeader,
    #[serde(default)]
    pub content: LogContent,
}

impl LogLetter {
    pub fn new(ident: impl Into<String>, log_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            header: LogHeader {
                ident: ident.into(),
                log_id: log_id.into(),
            },
            content: LogContent {
                log_msg: msg.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRegister {
    #[serde(default)]
    pub header: LogHeader,
    #[serde(default)]
    pub content: NoContent,
}

impl LogRegister {
    pub fn new(ident: impl Into<String>, log_id: impl Into<String>) -> Self {
        Self {
            header: LogHeader {
                ident: ident.into(),
                log_id: log_id.into(),
            },
            content: NoContent {},
        }
    }
}

// Heartbeat

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatHeader {
    pub ident: String,
    #[serde(with = "seq_string")]
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub header: HeartbeatHeader,
    #[serde(default)]
    pub content: NoContent,
}

impl Heartbeat {
    pub fn new(ident: impl Into<String>, seq: u64) -> Self {
        Self {
            header: HeartbeatHeader {
                ident: ident.into(),
                seq,
            },
            content: NoContent {},
        }
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }
}

mod seq_string {
    use super::*;

    pub fn serialize<S: Serializer>(seq: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(seq)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// BinaryFile

/// One chunk of an artifact stream. An empty payload ends the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryFile {
    pub tid: String,
    pub parent: String,
    pub file_name: String,
    pub menu: String,
    pub payload: Bytes,
}

impl BinaryFile {
    pub fn chunk(
        tid: impl Into<String>,
        file_name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            tid: tid.into(),
            file_name: file_name.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_post(mut self, parent: impl Into<String>, menu: impl Into<String>) -> Self {
        self.parent = parent.into();
        self.menu = menu.into();
        self
    }

    /// The zero-length letter that closes the stream for this chunk's task.
    pub fn terminator(&self) -> Self {
        Self {
            payload: Bytes::new(),
            ..self.clone()
        }
    }

    pub fn is_last(&self) -> bool {
        self.payload.is_empty()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
