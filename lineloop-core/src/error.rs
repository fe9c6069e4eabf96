use std::path::Path;

/// Category of a loop-level failure, mirrored into telemetry as a string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    JsonDecode,
    Subprocess,
    Io,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::JsonDecode => "json_decode",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::Io => "io",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Structured error with context for logging and diagnosis.
///
/// Gateways never raise these upstream; they format them into warn logs and
/// return degraded results. The context list keeps insertion order so the
/// rendered message reads the way the call site built it.
#[derive(Debug)]
pub struct LoopError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Vec<(String, String)>,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl LoopError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            cause: None,
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.push((key.to_string(), value.to_string()));
        self
    }

    pub fn caused_by(mut self, err: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(err));
        self
    }

    pub fn timeout(cmd: &str, seconds: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Command timed out after {seconds}s"),
        )
        .with("command", cmd)
        .with("timeout_seconds", seconds)
    }

    pub fn json_decode(source: &str, err: serde_json::Error) -> Self {
        Self::new(ErrorKind::JsonDecode, format!("Failed to parse JSON from {source}"))
            .with("source", source)
            .caused_by(err)
    }

    pub fn subprocess(cmd: &str, exit_code: i32, stderr: &str) -> Self {
        let mut err = Self::new(
            ErrorKind::Subprocess,
            format!("Command failed with exit code {exit_code}"),
        )
        .with("command", cmd)
        .with("returncode", exit_code);
        let trimmed = stderr.trim();
        if !trimmed.is_empty() {
            let clipped: String = trimmed.chars().take(200).collect();
            err = err.with("stderr", clipped);
        }
        err
    }

    pub fn io(operation: &str, path: &Path, err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("I/O error during {operation}"))
            .with("path", path.display())
            .caused_by(err)
    }
}

impl std::fmt::Display for LoopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)?;
        if !self.context.is_empty() {
            let ctx: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " ({})", ctx.join(", "))?;
        }
        if let Some(cause) = &self.cause {
            write!(f, " cause: {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LoopError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for LoopError {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, value.to_string()).caused_by(value)
    }
}
