use thiserror::Error;

use crate::hooks::HookType;

/// Failures surfaced by the engine.
///
/// `Pause` is deliberately absent: suspending a connection is a hook
/// outcome, not a failure, and never travels through this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed request: {0}")]
    Parse(&'static str),

    #[error("request body exceeds the configured maximum")]
    DataTooLong,

    #[error("hook {0:?} aborted the transaction")]
    HookAbort(HookType),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
