use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::coords::Size;
use crate::cua::{env_nonempty, CuaConfig};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "computer-use-preview";

#[derive(Clone, Debug)]
pub struct Config {
    pub cua: CuaConfig,
    pub model: String,
    pub confirm_model: Option<String>,
    pub display: Size,
    pub environment: String,
    pub max_steps: u32,
    pub retry: RetryPolicy,
    pub auto_confirm: bool,
    pub max_auto_confirms: u32,
    pub max_confirmation_rounds: u32,
    pub auto_ack_safety_checks: bool,
    pub log_typed_text: bool,
    pub session_log: Option<PathBuf>,
    pub guidance: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_nonempty)
    }

    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let cua = CuaConfig::from_lookup(var)?;
        let display = Size::new(
            parse_or(var, "CUA_DISPLAY_WIDTH", 2560)?,
            parse_or(var, "CUA_DISPLAY_HEIGHT", 1600)?,
        )?;

        let max_steps: u32 = parse_or(var, "CUA_MAX_STEPS", 30)?;
        if max_steps == 0 {
            return Err(invalid("CUA_MAX_STEPS", "0"));
        }
        let max_attempts: u32 = parse_or(var, "CUA_MAX_ATTEMPTS", 9)?;
        if max_attempts == 0 {
            return Err(invalid("CUA_MAX_ATTEMPTS", "0"));
        }
        let initial_ms: u64 = parse_or(var, "CUA_INITIAL_BACKOFF_MS", 1000)?;
        let max_ms: u64 = parse_or(var, "CUA_MAX_BACKOFF_MS", 30_000)?;
        if initial_ms > max_ms {
            return Err(invalid("CUA_INITIAL_BACKOFF_MS", &initial_ms.to_string()));
        }
        let max_confirmation_rounds: u32 = parse_or(var, "CUA_MAX_CONFIRMATION_ROUNDS", 10)?;
        if max_confirmation_rounds == 0 {
            return Err(invalid("CUA_MAX_CONFIRMATION_ROUNDS", "0"));
        }

        Ok(Self {
            cua,
            model: var("OPENAI_CUA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            confirm_model: var("OPENAI_CONFIRM_MODEL"),
            display,
            environment: var("CUA_ENVIRONMENT").unwrap_or_else(|| "browser".into()),
            max_steps,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
            },
            auto_confirm: flag(var, "CUA_AUTO_CONFIRM", true),
            max_auto_confirms: parse_or(var, "CUA_MAX_AUTO_CONFIRMS", 3)?,
            max_confirmation_rounds,
            auto_ack_safety_checks: flag(var, "CUA_AUTO_ACK_SAFETY_CHECKS", false),
            log_typed_text: flag(var, "CUA_LOG_TYPED_TEXT", false),
            session_log: var("CUA_SESSION_LOG").map(PathBuf::from),
            guidance: var("CUA_GUIDANCE"),
        })
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::Invalid { name: name.into(), value: value.into() }
}

fn parse_or<T: FromStr>(var: &dyn Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(raw) => raw.parse().map_err(|_| invalid(name, &raw)),
        None => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on")
}

fn flag(var: &dyn Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    var(name).map(|v| parse_bool(&v)).unwrap_or(default)
}
