use serde::Serialize;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    AwaitingAssistant,
    Dispatching,
    Confirming,
    AwaitingHuman,
    Completed,
    StepBudgetExhausted,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub step: u32,
    pub max_steps: u32,
    pub phase: Phase,
    pub last_action: Option<String>,
}

pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    pub fn new(max_steps: u32) -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot {
            step: 0,
            max_steps,
            phase: Phase::Starting,
            last_action: None,
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn phase(&self, phase: Phase) {
        self.tx.send_modify(|s| s.phase = phase);
    }

    pub fn step(&self, step: u32, last_action: String) {
        self.tx.send_modify(|s| {
            s.step = step;
            s.last_action = Some(last_action);
        });
    }
}
