use std::io::{self, BufRead, Write};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::cua::SafetyCheck;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EscalationDecision {
    Confirm,
    Reply(String),
    Unavailable,
}

#[async_trait]
pub trait EscalationChannel: Send + Sync {
    async fn request_decision(&self, utterance: &str) -> EscalationDecision;

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> bool;
}

#[derive(Clone)]
pub struct SafetyAcknowledger {
    auto_ack: bool,
    channel: Arc<dyn EscalationChannel>,
}

impl SafetyAcknowledger {
    pub fn new(auto_ack: bool, channel: Arc<dyn EscalationChannel>) -> Self {
        Self { auto_ack, channel }
    }

    pub async fn acknowledge(&self, checks: &[SafetyCheck]) -> bool {
        if checks.is_empty() {
            return false;
        }
        if self.auto_ack {
            info!(count = checks.len(), "auto-acknowledging safety checks");
            return true;
        }
        self.channel.acknowledge_safety_checks(checks).await
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleEscalation;

impl ConsoleEscalation {
    async fn prompt(text: String) -> Option<String> {
        tokio::task::spawn_blocking(move || {
            let mut out = io::stdout();
            let _ = write!(out, "{text}");
            let _ = out.flush();
            let mut line = String::new();
            match io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim().to_string()),
            }
        })
        .await
        .ok()
        .flatten()
    }
}

pub fn parse_console_answer(answer: Option<&str>) -> EscalationDecision {
    match answer.map(str::trim) {
        Some(a) if matches!(a.to_lowercase().as_str(), "y" | "yes") => EscalationDecision::Confirm,
        Some(a) if a.is_empty() || matches!(a.to_lowercase().as_str(), "n" | "no") => {
            EscalationDecision::Reply(DECLINE_REPLY.to_string())
        }
        Some(a) => EscalationDecision::Reply(a.to_string()),
        None => EscalationDecision::Unavailable,
    }
}

pub const DECLINE_REPLY: &str =
    "No. Do not perform that operation. Continue with a safe alternative, or stop and explain why you cannot.";

#[async_trait]
impl EscalationChannel for ConsoleEscalation {
    async fn request_decision(&self, utterance: &str) -> EscalationDecision {
        let prompt = format!(
            "\n[confirm] The assistant is asking:\n{utterance}\nProceed? [y/N, or type a reply]: "
        );
        let answer = Self::prompt(prompt).await;
        parse_console_answer(answer.as_deref())
    }

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> bool {
        let mut prompt = String::from("\n[safety] Computer tool safety check requires acknowledgement.\n");
        for c in checks {
            prompt.push_str(&format!("  - {} {} {}\n", c.id, c.code, c.message));
        }
        prompt.push_str("Acknowledge and continue? [y/N]: ");
        let answer = Self::prompt(prompt).await.unwrap_or_default().to_lowercase();
        matches!(answer.as_str(), "y" | "yes")
    }
}

#[derive(Debug)]
pub enum EscalationRequest {
    Confirmation { utterance: String, respond: oneshot::Sender<EscalationDecision> },
    SafetyChecks { checks: Vec<SafetyCheck>, respond: oneshot::Sender<bool> },
}

pub struct ChannelEscalation {
    request_tx: mpsc::Sender<EscalationRequest>,
    // Serialises requests so answers cannot be interleaved.
    gate: Mutex<()>,
}

impl ChannelEscalation {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<EscalationRequest>) {
        let (request_tx, request_rx) = mpsc::channel(buffer.max(1));
        (Self { request_tx, gate: Mutex::new(()) }, request_rx)
    }
}

#[async_trait]
impl EscalationChannel for ChannelEscalation {
    async fn request_decision(&self, utterance: &str) -> EscalationDecision {
        let _guard = self.gate.lock().await;
        let (respond, rx) = oneshot::channel();
        let req = EscalationRequest::Confirmation { utterance: utterance.to_string(), respond };
        if self.request_tx.send(req).await.is_err() {
            warn!("escalation receiver dropped");
            return EscalationDecision::Unavailable;
        }
        rx.await.unwrap_or(EscalationDecision::Unavailable)
    }

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> bool {
        let _guard = self.gate.lock().await;
        let (respond, rx) = oneshot::channel();
        let req = EscalationRequest::SafetyChecks { checks: checks.to_vec(), respond };
        if self.request_tx.send(req).await.is_err() {
            warn!("escalation receiver dropped; not acknowledging");
            return false;
        }
        rx.await.unwrap_or(false)
    }
}
