use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::confirmation::{ConfirmationGate, ConfirmationVerdict};
use crate::coords::Size;
use crate::cua::{ComputerTool, CuaRequest, ResponseId, SafetyCheck};
use crate::dispatch::{summarize_action, ActionDispatcher};
use crate::error::AgentError;
use crate::escalation::{EscalationChannel, EscalationDecision, SafetyAcknowledger};
use crate::retry::RetryingClient;
use crate::session_log::{SessionLog, TracingSessionLog};
use crate::status::{Phase, StatusPublisher, StatusSnapshot};

// ========================= Core Types =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub model: String,
    pub display: Size,
    pub environment: String,
    pub max_steps: u32,
    pub guidance: Option<String>,
    pub max_auto_confirms: u32,
    pub max_confirmation_rounds: u32,
    pub log_typed_text: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: crate::config::DEFAULT_MODEL.into(),
            display: Size { width: 2560, height: 1600 },
            environment: "browser".into(),
            max_steps: 30,
            guidance: None,
            max_auto_confirms: 3,
            max_confirmation_rounds: 10,
            log_typed_text: false,
        }
    }
}

impl From<&Config> for AgentConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            display: cfg.display,
            environment: cfg.environment.clone(),
            max_steps: cfg.max_steps,
            guidance: cfg.guidance.clone(),
            max_auto_confirms: cfg.max_auto_confirms,
            max_confirmation_rounds: cfg.max_confirmation_rounds,
            log_typed_text: cfg.log_typed_text,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    pub step: u32,
    pub max_steps: u32,
    pub prior_response_id: Option<ResponseId>,
    pub model_name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    Completed,
    StepBudgetExhausted,
    FatalError,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub run_id: String,
    pub terminal: Terminal,
    pub cause: Option<String>,
    pub error: Option<AgentError>,
    pub steps: u32,
    pub last_response_id: Option<ResponseId>,
    pub last_action: Option<String>,
    pub elapsed: Duration,
}

// ========================= Agent Loop =========================

pub struct AgentLoop {
    client: RetryingClient,
    gate: ConfirmationGate,
    dispatcher: ActionDispatcher,
    escalation: Arc<dyn EscalationChannel>,
    acknowledger: SafetyAcknowledger,
    log: Arc<dyn SessionLog>,
    status: StatusPublisher,
    cfg: AgentConfig,
}

struct Progress {
    session: Session,
    last_action: Option<String>,
    last_message: Option<String>,
}

impl AgentLoop {
    pub fn new(
        client: RetryingClient,
        gate: ConfirmationGate,
        dispatcher: ActionDispatcher,
        escalation: Arc<dyn EscalationChannel>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            client,
            gate,
            dispatcher,
            acknowledger: SafetyAcknowledger::new(false, escalation.clone()),
            escalation,
            log: Arc::new(TracingSessionLog),
            status: StatusPublisher::new(cfg.max_steps),
            cfg,
        }
    }

    pub fn with_safety_acknowledger(mut self, acknowledger: SafetyAcknowledger) -> Self {
        self.acknowledger = acknowledger;
        self
    }

    pub fn with_session_log(mut self, log: Arc<dyn SessionLog>) -> Self {
        self.log = log;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    pub async fn run(&self, instruction: &str) -> RunReport {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut progress = Progress {
            session: Session {
                step: 0,
                max_steps: self.cfg.max_steps,
                prior_response_id: None,
                model_name: self.cfg.model.clone(),
                started_at: Utc::now(),
            },
            last_action: None,
            last_message: None,
        };
        info!(run_id = %run_id, model = %self.cfg.model, max_steps = self.cfg.max_steps, "run started");

        let (terminal, cause, error) = match self.drive(instruction, &mut progress).await {
            Ok(Terminal::Completed) => (Terminal::Completed, progress.last_message.clone(), None),
            Ok(terminal) => (terminal, Some(format!("step budget of {} exhausted", self.cfg.max_steps)), None),
            Err(err) => {
                warn!(step = progress.session.step, "run failed: {err}");
                self.log.record(progress.session.step, "error", &err.to_string()).await;
                (Terminal::FatalError, Some(err.to_string()), Some(err))
            }
        };
        self.status.phase(match terminal {
            Terminal::Completed => Phase::Completed,
            Terminal::StepBudgetExhausted => Phase::StepBudgetExhausted,
            Terminal::FatalError => Phase::Failed,
        });

        let report = RunReport {
            run_id,
            terminal,
            cause,
            error,
            steps: progress.session.step,
            last_response_id: progress.session.prior_response_id,
            last_action: progress.last_action,
            elapsed: start.elapsed(),
        };
        info!(run_id = %report.run_id, terminal = ?report.terminal, steps = report.steps, "run finished");
        report
    }

    async fn drive(&self, instruction: &str, p: &mut Progress) -> Result<Terminal, AgentError> {
        let model = self.cfg.model.as_str();
        let tool = ComputerTool { display: self.cfg.display, environment: self.cfg.environment.clone() };
        let screen = self.dispatcher.screen_size().await?;
        let mut request = CuaRequest::initial(model, tool.clone(), self.cfg.guidance.as_deref(), instruction);
        let mut auto_confirms = 0u32;
        let mut rounds = 0u32;

        loop {
            if p.session.step >= p.session.max_steps {
                return Ok(Terminal::StepBudgetExhausted);
            }
            self.status.phase(Phase::AwaitingAssistant);
            let resp = self.client.send(&request).await?;
            p.session.prior_response_id = Some(resp.id.clone());
            let narration = resp.narration();

            if let Some(call) = resp.computer_call {
                if !narration.is_empty() {
                    self.log.record(p.session.step, "message", &narration).await;
                }
                let acknowledged = self.acknowledge(p.session.step, &call.pending_safety_checks).await?;

                self.status.phase(Phase::Dispatching);
                let summary = summarize_action(&call.action, self.cfg.log_typed_text);
                let next_step = p.session.step + 1;
                let out = match self.dispatcher.dispatch(&call, screen, self.cfg.display).await {
                    Ok(out) => out,
                    Err(err) => {
                        self.log.record(next_step, call.action.name(), &format!("{summary} failed: {err}")).await;
                        return Err(err);
                    }
                };
                p.session.step = next_step;
                auto_confirms = 0;
                rounds = 0;

                let detail = match &out.detail {
                    Some(d) => format!("{summary} ({d})"),
                    None => summary.clone(),
                };
                self.log.record(next_step, call.action.name(), &detail).await;
                info!(step = next_step, call_id = %call.call_id, action = %summary, "agent step");
                self.status.step(next_step, summary.clone());
                p.last_action = Some(summary);

                request = CuaRequest::computer_output(
                    model,
                    tool.clone(),
                    &resp.id,
                    &call.call_id,
                    out.observation,
                    &acknowledged,
                );
                continue;
            }

            if narration.is_empty() {
                return Ok(Terminal::Completed);
            }
            self.log.record(p.session.step, "message", &narration).await;
            info!(step = p.session.step, "assistant message: {}", narration);
            p.last_message = Some(narration.clone());

            self.status.phase(Phase::Confirming);
            let verdict = self.gate.classify(&narration).await?;
            if verdict == ConfirmationVerdict::NotAConfirmation {
                return Ok(Terminal::Completed);
            }
            if rounds >= self.cfg.max_confirmation_rounds {
                return Err(AgentError::ConfirmationLoop(rounds));
            }
            rounds += 1;

            let reply = match verdict {
                ConfirmationVerdict::AutoConfirm if auto_confirms < self.cfg.max_auto_confirms => {
                    auto_confirms += 1;
                    let reply = self.gate.compose_reply(&narration).to_string();
                    self.log.record(p.session.step, "auto_confirm", &reply).await;
                    reply
                }
                verdict => {
                    if verdict == ConfirmationVerdict::AutoConfirm {
                        info!(auto_confirms, "auto-confirm limit reached; escalating");
                    }
                    self.status.phase(Phase::AwaitingHuman);
                    let reply = match self.escalation.request_decision(&narration).await {
                        EscalationDecision::Confirm => self.gate.affirmative_reply().to_string(),
                        EscalationDecision::Reply(text) => text,
                        EscalationDecision::Unavailable => {
                            return Err(AgentError::EscalationUnavailable(narration));
                        }
                    };
                    self.log.record(p.session.step, "escalation", &reply).await;
                    reply
                }
            };
            request = CuaRequest::user_message(model, tool.clone(), &resp.id, &reply);
        }
    }

    async fn acknowledge(&self, step: u32, checks: &[SafetyCheck]) -> Result<Vec<SafetyCheck>, AgentError> {
        if checks.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = checks.iter().map(|c| c.id.clone()).collect();
        self.status.phase(Phase::AwaitingHuman);
        if !self.acknowledger.acknowledge(checks).await {
            return Err(AgentError::SafetyDeclined(ids));
        }
        self.log.record(step, "safety_ack", &ids.join(",")).await;
        Ok(checks.to_vec())
    }
}
