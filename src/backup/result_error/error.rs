use crate::backup::result_error::{AddFunctionName, AddMsg};
use std::io::ErrorKind;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error("storage full: {0}")]
    StorageFull(#[source] std::io::Error),
    #[error("target is locked: {0}")]
    TargetLocked(#[source] std::io::Error),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config version not found: {0}")]
    VersionNotFound(Uuid),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("configuration rejected: {0}")]
    InvalidConfiguration(String),
    #[error("safety save before restore failed:\n{}", indent::indent_all_with("  ", .0.to_string()))]
    SafetyBackupFailed(Box<Error>),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFnName { fn_name: String, error: Box<Error> },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded | ErrorKind::FileTooLarge => {
                Error::StorageFull(e)
            }
            ErrorKind::ResourceBusy | ErrorKind::ExecutableFileBusy => Error::TargetLocked(e),
            _ => Error::Io(e),
        }
    }
}

impl Error {
    pub fn corrupt_archive<S: Into<String>>(reason: S) -> Self {
        Error::CorruptArchive(reason.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid_schedule<S: Into<String>>(reason: S) -> Self {
        Error::InvalidSchedule(reason.into())
    }

    pub fn invalid_configuration<S: Into<String>>(reason: S) -> Self {
        Error::InvalidConfiguration(reason.into())
    }

    /// Strips context wrappers so callers can match on the underlying variant.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.root(),
            e => e,
        }
    }
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Error::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Error::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}
