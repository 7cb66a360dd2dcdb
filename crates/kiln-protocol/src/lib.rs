mod codec;
mod command;
mod errors;
mod letter;

pub use codec::{BINARY_HEADER_LEN, BINARY_MARKER, LetterCodec, MAX_BINARY_PAYLOAD};
pub use command::{Command, PORT_KEY, Role};
pub use errors::ProtocolError;
pub use letter::{
    BinaryFile, BuildOrder, Cancel, CancelHeader, CmdResponse, CmdResponseContent,
    CmdResponseHeader, CmdState, CommandHeader, CommandLetter, Heartbeat, HeartbeatHeader,
    IdentHeader, Letter, LogContent, LogHeader, LogLetter, LogRegister, MenuContent, MenuHeader,
    MenuLetter, NewTask, NewTaskContent, NewTaskHeader, NoContent, PostContent, PostHeader,
    PostLetter, PropertyContent, PropertyNotify, Response, ResponseContent, ResponseHeader,
    ResponseState,
};
