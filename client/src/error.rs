use thiserror::Error;

use crate::common::ResultId;
use crate::state::result::ResultState;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{field} is {len} bytes long, limit is {max}")]
    TextTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Project already attached: {0}")]
    DuplicateProject(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("No usable version of app {0}")]
    NoAppVersion(String),

    #[error("Workunit not found: {0}")]
    WorkunitNotFound(String),

    #[error("Result not found: {0}")]
    ResultNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("{kind} {name} already exists")]
    DuplicateEntity { kind: &'static str, name: String },

    #[error("No more URLs for {0}")]
    NoMoreUrls(String),

    #[error("All mirrors exhausted for {0}")]
    AllMirrorsExhausted(String),

    #[error("Transfer already in progress for {0}")]
    TransferInProgress(String),

    #[error("No active transfer for {0}")]
    NoActiveTransfer(String),

    #[error("{kind} {name} is still referenced ({ref_cnt} references)")]
    StillReferenced {
        kind: &'static str,
        name: String,
        ref_cnt: u32,
    },

    #[error("App version {0} is still current")]
    NotSuperseded(String),

    #[error("File {0} is sticky")]
    StickyFile(String),

    #[error("Verification of {name} failed: {reason}")]
    Verification { name: String, reason: String },

    #[error("Result {result}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        result: ResultId,
        from: ResultState,
        to: ResultState,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;
