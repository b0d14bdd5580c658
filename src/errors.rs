// dumpship/src/errors.rs
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Rejections raised while merging defaults, the config document and CLI overrides.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("compression level {0} is outside the accepted range 0..=9")]
    CompressionOutOfRange(i64),

    #[error("no upload target configured; set either the `s3` or the `github` section")]
    NoUploadTarget,

    #[error("both `s3` and `github` upload targets are configured; keep exactly one")]
    ConflictingUploadTargets,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload rejected with HTTP status {http_status}")]
    HttpStatus { http_status: u16 },

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("object storage error: {0}")]
    Transport(String),

    #[error("failed to read dump artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("the repository contents API needs the complete dump up front; streaming capture is not supported")]
    StreamingUnsupported,

    #[error("upload cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no running container matches pattern `{pattern}`")]
    ContainerNotFound { pattern: String },

    #[error("container lookup through `{cli}` failed: {message}")]
    ContainerLookup { cli: String, message: String },

    #[error("this command must be launched by OS user `{expected}`, not `{actual}`")]
    IdentityMismatch { expected: String, actual: String },

    #[error("could not determine the invoking OS user: {0}")]
    Identity(String),

    #[error("`{program}` executable not found in PATH")]
    ToolNotFound { program: String },

    #[error("dump process failed (exit code {}): {stderr_tail}", describe_exit(.exit_code))]
    CaptureFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error(
        "dump process failed after streaming started (exit code {}): {stderr_tail}",
        describe_exit(.exit_code)
    )]
    CapturePartialFailure {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl BackupError {
    /// Cancellation surfaces from capture directly and from the sinks as an upload error.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            BackupError::Cancelled | BackupError::Upload(UploadError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Pipeline stage in which a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveConfig,
    ResolveContainer,
    BuildCommand,
    Preflight,
    Capture,
    Deliver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ResolveConfig => "config resolution",
            Stage::ResolveContainer => "container resolution",
            Stage::BuildCommand => "command build",
            Stage::Preflight => "pre-flight checks",
            Stage::Capture => "capture",
            Stage::Deliver => "delivery",
        };
        f.write_str(name)
    }
}

/// Terminal failure of a run: the stage it reached and why it stopped.
#[derive(Error, Debug)]
#[error("backup failed during {stage}: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: BackupError,
}

impl PipelineError {
    pub fn at<E: Into<BackupError>>(stage: Stage) -> impl FnOnce(E) -> PipelineError {
        move |source| PipelineError {
            stage,
            source: source.into(),
        }
    }
}

/// Renders an optional exit code; `None` means the process was killed by a signal.
fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none, terminated by signal".to_string(),
    }
}
