#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cua_pilot::cua::{CuaAction, CuaRequest, CuaResponse, ProposedAction, ResponseId, SafetyCheck};
use cua_pilot::error::ActionExecutionError;
use cua_pilot::escalation::{EscalationChannel, EscalationDecision};
use cua_pilot::{
    ActionDispatcher, ActionExecutor, AgentConfig, AgentLoop, ConfirmationGate, ConfirmationPolicy, Observation,
    PhysicalAction, RetryPolicy, RetryingClient, ScreenCapture, Size, Transport, TransportError,
};

/// Replays canned transport results and records every request it receives.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<CuaResponse, TransportError>>>,
    pub seen: Mutex<Vec<CuaRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<CuaResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into()), seen: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn request(&self, n: usize) -> CuaRequest {
        self.seen.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn create(&self, request: &CuaRequest) -> Result<CuaResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("transport called more times than scripted"))
    }
}

pub fn message(id: &str, text: &str) -> Result<CuaResponse, TransportError> {
    Ok(CuaResponse { id: ResponseId(id.into()), computer_call: None, texts: vec![text.into()] })
}

pub fn action(id: &str, call_id: &str, action: CuaAction) -> Result<CuaResponse, TransportError> {
    action_with_checks(id, call_id, action, Vec::new())
}

pub fn action_with_checks(
    id: &str,
    call_id: &str,
    action: CuaAction,
    pending_safety_checks: Vec<SafetyCheck>,
) -> Result<CuaResponse, TransportError> {
    Ok(CuaResponse {
        id: ResponseId(id.into()),
        computer_call: Some(ProposedAction { call_id: call_id.into(), action, pending_safety_checks }),
        texts: Vec::new(),
    })
}

/// Stand-in for the input device and the display.
pub struct FakeComputer {
    pub size: Size,
    pub performed: Mutex<Vec<PhysicalAction>>,
    pub captures: Mutex<u32>,
}

impl FakeComputer {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self { size: Size { width, height }, performed: Mutex::new(Vec::new()), captures: Mutex::new(0) })
    }

    pub fn performed(&self) -> Vec<PhysicalAction> {
        self.performed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for FakeComputer {
    async fn execute(&self, action: &PhysicalAction) -> Result<(), ActionExecutionError> {
        self.performed.lock().unwrap().push(action.clone());
        Ok(())
    }
}

#[async_trait]
impl ScreenCapture for FakeComputer {
    async fn screen_size(&self) -> Result<Size, ActionExecutionError> {
        Ok(self.size)
    }

    async fn capture(&self) -> Result<Observation, ActionExecutionError> {
        let mut n = self.captures.lock().unwrap();
        *n += 1;
        Ok(Observation::png(format!("shot{}", *n)))
    }
}

/// Answers escalations from a queue and records what it was asked.
pub struct ScriptedEscalation {
    decisions: Mutex<VecDeque<EscalationDecision>>,
    ack: bool,
    pub asked: Mutex<Vec<String>>,
    pub checks_seen: Mutex<Vec<SafetyCheck>>,
}

impl ScriptedEscalation {
    pub fn new(decisions: Vec<EscalationDecision>, ack: bool) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            ack,
            asked: Mutex::new(Vec::new()),
            checks_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl EscalationChannel for ScriptedEscalation {
    async fn request_decision(&self, utterance: &str) -> EscalationDecision {
        self.asked.lock().unwrap().push(utterance.to_string());
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(EscalationDecision::Reply("stop".into()))
    }

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> bool {
        self.checks_seen.lock().unwrap().extend_from_slice(checks);
        self.ack
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: std::time::Duration::from_millis(10),
        max_backoff: std::time::Duration::from_millis(100),
    }
}

pub fn agent_config(max_steps: u32) -> AgentConfig {
    AgentConfig { max_steps, ..AgentConfig::default() }
}

pub fn build_loop(
    transport: Arc<ScriptedTransport>,
    computer: Arc<FakeComputer>,
    escalation: Arc<ScriptedEscalation>,
    cfg: AgentConfig,
) -> AgentLoop {
    build_loop_with(transport, computer, escalation, cfg)
}

pub fn build_loop_with(
    transport: Arc<ScriptedTransport>,
    computer: Arc<FakeComputer>,
    escalation: Arc<dyn EscalationChannel>,
    cfg: AgentConfig,
) -> AgentLoop {
    let client = RetryingClient::new(transport, fast_policy());
    let gate = ConfirmationGate::new(ConfirmationPolicy::default());
    let dispatcher = ActionDispatcher::new(computer.clone(), computer).with_settle(false);
    AgentLoop::new(client, gate, dispatcher, escalation, cfg)
}
