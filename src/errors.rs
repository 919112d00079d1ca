//! Framework error kinds and their exit-code / HTTP mappings.
//!
//! Boot-time failures (dependency problems, migration problems) are fatal
//! and abort with exit code 4.  Runtime failures are surfaced to the
//! caller: permission denials stay in-process, IPC errors are mapped to an
//! HTTP status plus a sanitized `{kind, message, skill?, detail?}` body.

use crate::permissions::Capability;
use serde::Serialize;

/// Structured framework error.
///
/// Application edges still use `anyhow::Result`; this enum exists so the
/// CLI can map failures to stable exit codes and the daemon can map them
/// to stable HTTP statuses without string matching.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("config error: {0}")]
    Config(String),

    #[error("skill '{skill}' requires '{dep}' which is not installed")]
    UnmetDependency { skill: String, dep: String },

    #[error("skill '{skill}' requires '{dep}@{constraint}' but version {found} is installed")]
    VersionConstraintFailed {
        skill: String,
        dep: String,
        constraint: String,
        found: String,
    },

    #[error("dependency cycle: {}", cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("migration checksum mismatch: {skill} version {version} ({filename})")]
    MigrationChecksumMismatch {
        skill: String,
        version: i64,
        filename: String,
    },

    #[error("migration failed: {skill} {filename}: {source}")]
    MigrationApplyFailed {
        skill: String,
        filename: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("permission denied: skill '{skill}' lacks {capability}")]
    PermissionDenied {
        skill: String,
        capability: Capability,
    },

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("method not found: {skill}.{method}")]
    MethodNotFound { skill: String, method: String },

    #[error("handler timed out after {timeout_secs}s")]
    HandlerTimeout { timeout_secs: u64 },

    #[error("store busy: {0}")]
    StoreBusy(String),

    #[error("store i/o error: {0}")]
    StoreIo(#[from] rusqlite::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

/// Stable machine-readable kind tag, used in IPC bodies and logs.
impl FrameworkError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::UnmetDependency { .. } => "UNMET_DEPENDENCY",
            Self::VersionConstraintFailed { .. } => "VERSION_CONSTRAINT_FAILED",
            Self::DependencyCycle { .. } => "DEPENDENCY_CYCLE",
            Self::MigrationChecksumMismatch { .. } => "MIGRATION_CHECKSUM_MISMATCH",
            Self::MigrationApplyFailed { .. } => "MIGRATION_APPLY_FAILED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::SkillNotFound(_) => "SKILL_NOT_FOUND",
            Self::MethodNotFound { .. } => "METHOD_NOT_FOUND",
            Self::HandlerTimeout { .. } => "HANDLER_TIMEOUT",
            Self::StoreBusy(_) => "STORE_BUSY",
            Self::StoreIo(_) => "STORE_IO",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// CLI exit code: 0 ok, 1 general, 2 invalid args, 3 skill not found,
    /// 4 store/boot error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::SkillNotFound(_) => 3,
            Self::Config(_)
            | Self::UnmetDependency { .. }
            | Self::VersionConstraintFailed { .. }
            | Self::DependencyCycle { .. }
            | Self::MigrationChecksumMismatch { .. }
            | Self::MigrationApplyFailed { .. }
            | Self::StoreBusy(_)
            | Self::StoreIo(_) => 4,
            _ => 1,
        }
    }

    /// HTTP status used by the daemon when the error crosses the IPC
    /// boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::PermissionDenied { .. } => 403,
            Self::SkillNotFound(_) | Self::MethodNotFound { .. } => 404,
            Self::InvalidArgument(_) => 400,
            Self::HandlerTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Sanitized IPC body. Never includes backtraces or source chains.
    pub fn to_body(&self) -> ErrorBody {
        let (skill, detail) = match self {
            Self::PermissionDenied { skill, capability } => {
                (Some(skill.clone()), Some(capability.to_string()))
            }
            Self::MethodNotFound { skill, method } => {
                (Some(skill.clone()), Some(method.clone()))
            }
            Self::SkillNotFound(name) => (Some(name.clone()), None),
            Self::UnmetDependency { skill, dep } => (Some(skill.clone()), Some(dep.clone())),
            Self::MigrationChecksumMismatch {
                skill, filename, ..
            } => (Some(skill.clone()), Some(filename.clone())),
            _ => (None, None),
        };
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
            skill,
            detail,
        }
    }

    /// Classify a raw rusqlite error, separating busy-timeout expiry from
    /// other store failures.
    pub fn from_store(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return Self::StoreBusy(msg.clone().unwrap_or_else(|| "database busy".into()));
            }
        }
        Self::StoreIo(err)
    }
}

/// Wire shape for IPC error responses.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub type Result<T> = std::result::Result<T, FrameworkError>;
