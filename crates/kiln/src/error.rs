use std::fmt;

/// Broad failure classes. The split drives whether a re-run can help: precondition and
/// config problems need the operator to change inputs, the rest are environmental.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required input missing or malformed (brand files, engine tree, patch dir).
    Precondition,
    /// Build definition could not be parsed or is inconsistent.
    Config,
    /// An external engine call failed; the message carries its raw diagnostic text.
    Engine,
    /// Filesystem or network I/O.
    Io,
    /// Tooling missing or misbehaving on the host (spawn failures, HTTP status).
    Environment,
    /// A kill-on-error dispatch tripped; the whole run must stop.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::Config => "config",
            ErrorKind::Engine => "engine",
            ErrorKind::Io => "io",
            ErrorKind::Environment => "environment",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Environment, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn precondition<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Precondition, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn fatal<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Fatal, msg)
    }

    /// Wraps an engine diagnostic verbatim below a short context line.
    pub fn engine(context: &str, diagnostic: &str) -> Self {
        let diagnostic = diagnostic.trim_end();
        let msg = if diagnostic.is_empty() {
            context.to_string()
        } else {
            format!("{context}\n{diagnostic}")
        };
        Self::new(ErrorKind::Engine, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    pub fn operator_must_fix(&self) -> bool {
        matches!(self.kind, ErrorKind::Precondition | ErrorKind::Config)
    }

    /// Prefixes the message, keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::io(format!("json error: {err}"))
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::io(format!("walkdir error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::io(format!("http error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
