//! Error types for gwatch-core

use std::fmt;
use thiserror::Error;

/// Operator-facing hint attached to the errors a user can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remediation {
    pub summary: String,
    /// Shell commands or config edits, tried in order.
    pub steps: Vec<String>,
}

impl Remediation {
    fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            steps: Vec::new(),
        }
    }

    fn step(mut self, step: impl Into<String>) -> Self {
        self.steps.push(step.into());
        self
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hint: {}", self.summary)?;
        for step in &self.steps {
            write!(f, "\n  try: {step}")?;
        }
        Ok(())
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport not yet connected. Retry-safe.
    NotReady,
    /// Lookup miss.
    NotExist,
    /// Registration attempted twice.
    AlreadyExist,
    /// Malformed or unknown input; the message is dropped.
    InvalidInput,
    /// Lower-layer failure.
    Failed,
    /// Storage engine failure.
    FailedSdk,
}

/// Main error type for gwatch-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("not found: {0}")]
    NotExist(String),

    #[error("already exists: {0}")]
    AlreadyExist(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("{sdk} failure: {message}")]
    FailedSdk { sdk: &'static str, message: String },

    /// Inbound reassembly would exceed the configured message size.
    #[error("receive buffer full: message exceeds {max_bytes} bytes")]
    BufferFull { max_bytes: usize },

    #[error("codec: {0}")]
    Codec(#[from] gwatch_codec::CodecError),

    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn not_exist(msg: impl Into<String>) -> Self {
        Self::NotExist(msg.into())
    }

    pub fn already_exist(msg: impl Into<String>) -> Self {
        Self::AlreadyExist(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        use gwatch_codec::CodecError;
        match self {
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::NotExist(_) => ErrorKind::NotExist,
            Self::AlreadyExist(_) => ErrorKind::AlreadyExist,
            Self::InvalidInput(_) | Self::Config(_) | Self::Json(_) => ErrorKind::InvalidInput,
            Self::Codec(
                CodecError::UnknownTypeId { .. }
                | CodecError::InvalidEnvelope(_)
                | CodecError::Json(_)
                | CodecError::BadFlags(_)
                | CodecError::Leb128(_)
                | CodecError::FrameTooLarge { .. },
            ) => ErrorKind::InvalidInput,
            Self::Codec(CodecError::PayloadMismatch { .. } | CodecError::Io(_)) => {
                ErrorKind::Failed
            }
            Self::FailedSdk { .. } | Self::Sql(_) => ErrorKind::FailedSdk,
            Self::Failed(_) | Self::BufferFull { .. } | Self::Io(_) => ErrorKind::Failed,
        }
    }

    /// True only for transient transport readiness failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NotReady
    }

    /// Hint for errors an operator can fix; `None` for everything else.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        use std::io::ErrorKind as Io;
        let hint = match self {
            Self::NotReady(_) => Remediation::new("no scheduler connection yet")
                .step("gw scheduler")
                .step("check GW_SCHEDULER_IPV4 and GW_SCHEDULER_SERVE_WS_PORT"),
            Self::Io(err) if err.kind() == Io::AddrInUse => {
                Remediation::new("the scheduler port is taken")
                    .step("gw scheduler --port <free port>")
            }
            Self::Io(err) if err.kind() == Io::ConnectionRefused => {
                Remediation::new("nothing listens at the scheduler address")
                    .step("gw scheduler")
                    .step("gw config")
            }
            Self::BufferFull { max_bytes } => Remediation::new(format!(
                "a peer sent a message over {max_bytes} bytes"
            ))
            .step("raise transport.max_message_size"),
            Self::Sql(_) | Self::FailedSdk { .. } => {
                Remediation::new("the SQL store rejected the operation")
                    .step("check that scheduler.sql_db_path is writable")
            }
            Self::Config(ConfigError::FileNotFound(path)) => {
                Remediation::new(format!("{path} does not exist"))
                    .step("pass --config or set GW_CONFIG")
            }
            Self::Config(ConfigError::ReadFailed(path, _)) => {
                Remediation::new(format!("{path} is not readable")).step(format!("ls -l {path}"))
            }
            Self::Config(ConfigError::InvalidEnv { name, .. }) => {
                Remediation::new(format!("{name} is malformed")).step(format!("unset {name}"))
            }
            Self::Config(_) => Remediation::new("the config file is invalid").step("gw config"),
            _ => return None,
        };
        Some(hint)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} not found")]
    FileNotFound(String),

    #[error("cannot read {0}: {1}")]
    ReadFailed(String, String),

    #[error("malformed TOML: {0}")]
    ParseFailed(String),

    #[error("cannot render TOML: {0}")]
    SerializeFailed(String),

    #[error("{name}={value:?} is not valid")]
    InvalidEnv { name: String, value: String },

    #[error("{0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwatch_codec::CodecError;
    use std::io;

    #[test]
    fn constructors_map_to_their_kind() {
        let cases = [
            (Error::not_ready("x"), ErrorKind::NotReady),
            (Error::not_exist("x"), ErrorKind::NotExist),
            (Error::already_exist("x"), ErrorKind::AlreadyExist),
            (Error::invalid_input("x"), ErrorKind::InvalidInput),
            (Error::failed("x"), ErrorKind::Failed),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn wrapped_errors_are_classified() {
        let sdk = Error::FailedSdk {
            sdk: "sqlite",
            message: "database is locked".into(),
        };
        assert_eq!(sdk.kind(), ErrorKind::FailedSdk);
        assert_eq!(Error::Sql(rusqlite::Error::InvalidQuery).kind(), ErrorKind::FailedSdk);
        assert_eq!(Error::BufferFull { max_bytes: 1 }.kind(), ErrorKind::Failed);
        assert_eq!(Error::Io(io::ErrorKind::BrokenPipe.into()).kind(), ErrorKind::Failed);

        let codec: Error = CodecError::UnknownTypeId {
            channel: "capsule",
            type_id: 7,
        }
        .into();
        assert_eq!(codec.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn retry_only_when_not_ready() {
        assert!(Error::not_ready("connecting").is_retryable());
        assert!(!Error::failed("send").is_retryable());
        assert!(!Error::invalid_input("type id").is_retryable());
    }

    #[test]
    fn operator_errors_carry_hints() {
        let port = Error::Config(ConfigError::InvalidEnv {
            name: "GW_SCHEDULER_SERVE_WS_PORT".into(),
            value: "abc".into(),
        });
        let hint = port.remediation().unwrap();
        assert_eq!(hint.steps, ["unset GW_SCHEDULER_SERVE_WS_PORT"]);

        for err in [
            Error::not_ready("scheduler"),
            Error::Io(io::ErrorKind::AddrInUse.into()),
            Error::Io(io::ErrorKind::ConnectionRefused.into()),
            Error::Config(ConfigError::ParseFailed("line 1".into())),
            Error::BufferFull { max_bytes: 10 },
        ] {
            assert!(err.remediation().is_some(), "{err:?}");
        }
        assert!(Error::not_exist("subscription").remediation().is_none());
        assert!(Error::Io(io::ErrorKind::BrokenPipe.into()).remediation().is_none());
    }

    #[test]
    fn hint_renders_one_step_per_line() {
        let text = Error::not_ready("scheduler").remediation().unwrap().to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "hint: no scheduler connection yet");
        assert_eq!(lines[1], "  try: gw scheduler");
        assert_eq!(lines.len(), 3);
    }
}
