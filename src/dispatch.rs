use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coords::{self, LogicalPoint, ScaledPoint, Size};
use crate::cua::{ActionKind, CuaAction, ProposedAction};
use crate::error::{ActionExecutionError, AgentError};

// ========================= Collaborator Types =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub mime_type: String,
    pub data_base64: String,
    pub captured_at_ms: u128,
}

impl Observation {
    pub fn png(data_base64: impl Into<String>) -> Self {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self {
            id: nanoid!(),
            mime_type: "image/png".into(),
            data_base64: data_base64.into(),
            captured_at_ms,
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PhysicalAction {
    Click { at: ScaledPoint, button: MouseButton },
    DoubleClick { at: ScaledPoint, button: MouseButton },
    Move { at: ScaledPoint },
    Drag { path: Vec<ScaledPoint>, button: MouseButton },
    Scroll { at: ScaledPoint, scroll_x: i64, scroll_y: i64 },
    Type { text: String },
    Keypress { keys: Vec<String> },
    Wait { duration: Duration },
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &PhysicalAction) -> Result<(), ActionExecutionError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn screen_size(&self) -> Result<Size, ActionExecutionError>;
    async fn capture(&self) -> Result<Observation, ActionExecutionError>;
}

// ========================= Normalisation =========================

pub fn normalize_key(key: &str) -> String {
    let k = key.trim().to_lowercase();
    let mapped = match k.as_str() {
        "control" | "ctl" => "ctrl",
        "escape" => "esc",
        "return" => "enter",
        "cmd" | "command" | "super" | "windows" | "win" => "meta",
        "option" => "alt",
        "pgup" => "pageup",
        "pgdn" => "pagedown",
        "del" => "delete",
        "arrowup" => "up",
        "arrowdown" => "down",
        "arrowleft" => "left",
        "arrowright" => "right",
        _ => return k,
    };
    mapped.to_string()
}

pub fn normalize_button(button: Option<&str>) -> MouseButton {
    match button.map(|b| b.trim().to_lowercase()).as_deref() {
        Some("right") => MouseButton::Right,
        Some("middle") | Some("wheel") => MouseButton::Middle,
        _ => MouseButton::Left,
    }
}

pub fn format_typed_text(text: &str, max_chars: usize) -> String {
    let compact = text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\\n");
    if compact.chars().count() > max_chars {
        let mut cut: String = compact.chars().take(max_chars).collect();
        cut.push('…');
        cut
    } else {
        compact
    }
}

pub fn summarize_action(action: &CuaAction, log_typed_text: bool) -> String {
    fn at(p: &Option<LogicalPoint>) -> String {
        match p {
            Some(p) => format!("x={} y={}", p.x, p.y),
            None => "x=? y=?".into(),
        }
    }
    match action {
        CuaAction::Click { at: p, button } | CuaAction::DoubleClick { at: p, button } => {
            let extra = button.as_deref().map(|b| format!(", button={b}")).unwrap_or_default();
            format!("{} {}{}", action.name(), at(p), extra)
        }
        CuaAction::Move { at: p } => format!("move {}", at(p)),
        CuaAction::Drag { path, .. } => format!("drag path_len={}", path.len()),
        CuaAction::Scroll { at: p, scroll_x, scroll_y } => {
            format!("scroll {} scroll_x={scroll_x} scroll_y={scroll_y}", at(p))
        }
        CuaAction::Type { text: Some(text) } if log_typed_text => {
            format!("type text_len={} text='{}'", text.chars().count(), format_typed_text(text, 200))
        }
        CuaAction::Type { text: Some(text) } => format!("type text_len={}", text.chars().count()),
        CuaAction::Type { text: None } => "type text_len=?".into(),
        CuaAction::Keypress { keys } => format!("keypress keys={}", keys.join("+")),
        CuaAction::Wait { duration_ms } => match duration_ms {
            Some(ms) => format!("wait duration_ms={ms}"),
            None => "wait".into(),
        },
        CuaAction::Screenshot => "screenshot".into(),
        CuaAction::Unknown(kind) => format!("unknown action '{kind}'"),
    }
}

fn settle_delay(kind: ActionKind) -> Duration {
    match kind {
        ActionKind::Click | ActionKind::DoubleClick | ActionKind::Drag | ActionKind::Scroll => {
            Duration::from_millis(200)
        }
        ActionKind::Move => Duration::from_millis(100),
        ActionKind::Type | ActionKind::Keypress => Duration::from_millis(500),
        ActionKind::Wait | ActionKind::Screenshot => Duration::ZERO,
    }
}

const DEFAULT_WAIT: Duration = Duration::from_millis(1000);

// ========================= Dispatcher =========================

#[derive(Clone, Debug)]
pub struct Dispatched {
    pub observation: Observation,
    pub physical: Option<PhysicalAction>,
    pub detail: Option<String>,
}

pub struct ActionDispatcher {
    executor: Arc<dyn ActionExecutor>,
    capture: Arc<dyn ScreenCapture>,
    settle: bool,
}

impl ActionDispatcher {
    pub fn new(executor: Arc<dyn ActionExecutor>, capture: Arc<dyn ScreenCapture>) -> Self {
        Self { executor, capture, settle: true }
    }

    pub fn with_settle(mut self, settle: bool) -> Self {
        self.settle = settle;
        self
    }

    pub async fn screen_size(&self) -> Result<Size, AgentError> {
        Ok(self.capture.screen_size().await?)
    }

    pub async fn dispatch(
        &self,
        proposed: &ProposedAction,
        screen: Size,
        logical: Size,
    ) -> Result<Dispatched, AgentError> {
        let kind = proposed
            .action
            .kind()
            .ok_or_else(|| AgentError::InvalidAction(format!("unsupported action type '{}'", proposed.action.name())))?;
        let physical = to_physical(&proposed.action, screen, logical)?;
        let detail = pointer_detail(&proposed.action, physical.as_ref(), screen, logical);

        if let Some(p) = &physical {
            self.executor.execute(p).await?;
            info!(call_id = %proposed.call_id, action = kind.as_str(), "action performed");
        }
        if self.settle {
            let delay = settle_delay(kind);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        let observation = self.capture.capture().await?;
        Ok(Dispatched { observation, physical, detail })
    }
}

fn require_point(p: &Option<LogicalPoint>, kind: &str) -> Result<LogicalPoint, AgentError> {
    p.ok_or_else(|| AgentError::InvalidAction(format!("{kind} requires integer x and y")))
}

pub fn to_physical(action: &CuaAction, screen: Size, logical: Size) -> Result<Option<PhysicalAction>, AgentError> {
    let map = |p: LogicalPoint| coords::scale(p, logical, screen).map_err(AgentError::from);
    let physical = match action {
        CuaAction::Click { at, button } => PhysicalAction::Click {
            at: map(require_point(at, "click")?)?,
            button: normalize_button(button.as_deref()),
        },
        CuaAction::DoubleClick { at, button } => PhysicalAction::DoubleClick {
            at: map(require_point(at, "double_click")?)?,
            button: normalize_button(button.as_deref()),
        },
        CuaAction::Move { at } => PhysicalAction::Move { at: map(require_point(at, "move")?)? },
        CuaAction::Drag { path, button } => {
            if path.len() < 2 {
                return Err(AgentError::InvalidAction(format!(
                    "drag path must contain at least 2 points, got {}",
                    path.len()
                )));
            }
            PhysicalAction::Drag {
                path: path.iter().map(|p| map(*p)).collect::<Result<Vec<_>, _>>()?,
                button: normalize_button(button.as_deref()),
            }
        }
        CuaAction::Scroll { at, scroll_x, scroll_y } => PhysicalAction::Scroll {
            at: map(require_point(at, "scroll")?)?,
            scroll_x: *scroll_x,
            scroll_y: *scroll_y,
        },
        CuaAction::Type { text } => match text {
            Some(text) => PhysicalAction::Type { text: text.clone() },
            None => return Err(AgentError::InvalidAction("type requires string text".into())),
        },
        CuaAction::Keypress { keys } => {
            let keys: Vec<String> =
                keys.iter().filter(|k| !k.trim().is_empty()).map(|k| normalize_key(k)).collect();
            if keys.is_empty() {
                return Err(AgentError::InvalidAction("keypress requires at least one key".into()));
            }
            PhysicalAction::Keypress { keys }
        }
        CuaAction::Wait { duration_ms } => PhysicalAction::Wait {
            duration: match duration_ms {
                Some(ms) if *ms > 0 => Duration::from_millis(*ms as u64),
                _ => DEFAULT_WAIT,
            },
        },
        CuaAction::Screenshot => return Ok(None),
        CuaAction::Unknown(kind) => {
            return Err(AgentError::InvalidAction(format!("unsupported action type '{kind}'")))
        }
    };
    Ok(Some(physical))
}

fn pointer_detail(action: &CuaAction, physical: Option<&PhysicalAction>, screen: Size, logical: Size) -> Option<String> {
    let logical_point = match action {
        CuaAction::Click { at, .. }
        | CuaAction::DoubleClick { at, .. }
        | CuaAction::Move { at }
        | CuaAction::Scroll { at, .. } => (*at)?,
        CuaAction::Drag { path, .. } => *path.last()?,
        _ => return None,
    };
    let physical_point = match physical? {
        PhysicalAction::Click { at, .. }
        | PhysicalAction::DoubleClick { at, .. }
        | PhysicalAction::Move { at }
        | PhysicalAction::Scroll { at, .. } => *at,
        PhysicalAction::Drag { path, .. } => *path.last()?,
        _ => return None,
    };
    Some(coords::pointer_debug(logical_point, logical, physical_point, screen))
}
