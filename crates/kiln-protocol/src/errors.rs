use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed with {pending} bytes of an incomplete letter")]
    Disconnected { pending: usize },
    #[error("malformed letter: {0}")]
    Malformed(String),
    #[error("unknown letter type: {0}")]
    UnknownType(String),
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
    #[error("letter of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("field {field} exceeds {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error means the peer went away rather than sent garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Disconnected { .. } => true,
            Self::Io(error) => matches!(
                error.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
