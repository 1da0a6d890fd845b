use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    ServerError,
    SafetyRequired,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::Transient | ErrorClass::ServerError)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Transient => "transient",
            ErrorClass::ServerError => "server_error",
            ErrorClass::SafetyRequired => "safety_required",
            ErrorClass::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct TransportError {
    pub class: ErrorClass,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub safety_check_ids: Vec<String>,
}

impl TransportError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self { class, message: message.into(), retry_after: None, safety_check_ids: Vec::new() }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self { retry_after, ..Self::new(ErrorClass::RateLimited, message) }
    }

    pub fn safety_required(message: impl Into<String>, ids: Vec<String>) -> Self {
        Self { safety_check_ids: ids, ..Self::new(ErrorClass::SafetyRequired, message) }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("size must be non-zero, got {width}x{height}")]
    ZeroSize { width: u32, height: u32 },
    #[error("missing required setting: {0}")]
    Missing(String),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("request failed after {attempts} attempt(s), last error {class}: {message}")]
    RetriesExhausted { class: ErrorClass, attempts: u32, message: String },
    #[error("request rejected ({class}): {message}")]
    Request { class: ErrorClass, message: String },
    #[error("safety check(s) not acknowledged: {0:?}")]
    SafetyDeclined(Vec<String>),
    #[error("confirmation classifier failed: {0}")]
    ClassificationFailure(String),
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error("action execution failed: {0}")]
    ActionExecution(String),
    #[error("no one is available to answer: {0}")]
    EscalationUnavailable(String),
    #[error("{0} confirmation rounds without an action")]
    ConfirmationLoop(u32),
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ActionExecutionError(pub String);

impl From<ActionExecutionError> for AgentError {
    fn from(e: ActionExecutionError) -> Self {
        AgentError::ActionExecution(e.0)
    }
}

impl AgentError {
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            AgentError::RetriesExhausted { class, .. } | AgentError::Request { class, .. } => {
                Some(*class)
            }
            AgentError::SafetyDeclined(_) => Some(ErrorClass::SafetyRequired),
            _ => None,
        }
    }
}
