pub mod agent;
pub mod browser;
pub mod config;
pub mod confirmation;
pub mod coords;
pub mod cua;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod retry;
pub mod session_log;
pub mod status;

pub use agent::{AgentConfig, AgentLoop, RunReport, Session, Terminal};
pub use browser::{BrowserConfig, ChromiumComputer};
pub use config::Config;
pub use confirmation::{ConfirmationGate, ConfirmationPolicy, ConfirmationVerdict};
pub use coords::{scale, LogicalPoint, ScaledPoint, Size};
pub use cua::{CuaConfig, HttpTransport, Transport};
pub use dispatch::{ActionDispatcher, ActionExecutor, Observation, PhysicalAction, ScreenCapture};
pub use error::{AgentError, ConfigError, ErrorClass, TransportError};
pub use escalation::{ChannelEscalation, ConsoleEscalation, EscalationChannel, EscalationDecision};
pub use retry::{RetryPolicy, RetryingClient};
