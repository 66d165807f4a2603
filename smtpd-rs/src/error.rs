use thiserror::Error;

/// Which timer fired. Timeouts inside a DATA/BDAT read answer with 451,
/// everything else with 421, so the session needs to know the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Greeting,
    Command,
    Data,
    Global,
}

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("bad sequence of commands")]
    Sequence,

    #[error("message size exceeds fixed maximum")]
    SizeExceeded,

    #[error("too many recipients")]
    TooManyRecipients,

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("line too long")]
    LineTooLong,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("{0:?} timer expired")]
    Timeout(TimeoutKind),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("queue temporarily unavailable: {0}")]
    QueueTemp(String),

    #[error("queue rejected envelope: {0}")]
    QueuePerm(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SmtpError {
    /// Errors that terminate the session once the best-effort reply has been
    /// written. All other errors leave the connection usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmtpError::LineTooLong
                | SmtpError::UnexpectedEof
                | SmtpError::Timeout(_)
                | SmtpError::Io(_)
                | SmtpError::Tls(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SmtpError>;
