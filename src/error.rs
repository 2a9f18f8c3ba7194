//! Daemon-wide error types.

use thiserror::Error;

/// Errors from the wire codec and tokenizer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    EmptyLine,

    #[error("line carries an origin but no command")]
    MissingCommand,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while dispatching one inbound line.
///
/// Any of these makes the line a parse error: it is logged and dropped, the
/// link stays up. Protocol violations that must drop the link are signalled
/// by the handler emitting `SQUIT`/closing instead of via this type.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("not enough parameters")]
    NeedMoreParams,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("unknown origin: {0}")]
    UnknownOrigin(String),

    #[error("no such server: {0}")]
    NoSuchServer(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    #[error("malformed mode change")]
    BadModeChange,

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl HandlerError {
    /// Static label for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NeedMoreParams => "need_more_params",
            Self::UnknownCommand(_) => "unknown_command",
            Self::UnknownOrigin(_) => "unknown_origin",
            Self::NoSuchServer(_) => "no_such_server",
            Self::NoSuchUser(_) => "no_such_user",
            Self::NoSuchChannel(_) => "no_such_channel",
            Self::BadModeChange => "bad_mode_change",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(HandlerError::NeedMoreParams.error_code(), "need_more_params");
        assert_eq!(
            HandlerError::UnknownCommand("X".into()).error_code(),
            "unknown_command"
        );
    }
}
