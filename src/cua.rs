use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coords::{LogicalPoint, Size};
use crate::dispatch::Observation;
use crate::error::{ConfigError, ErrorClass, TransportError};

#[derive(Clone, Debug)]
pub struct CuaConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,
    pub request_timeout: Duration,
}

impl CuaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_nonempty)
    }

    pub fn from_lookup(var: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base = var("OPENAI_BASE_URL")
            .map(|b| b.trim_end_matches('/').to_string())
            .or_else(|| {
                var("AZURE_OPENAI_ENDPOINT")
                    .map(|e| format!("{}/openai/v1", e.trim_end_matches('/')))
            })
            .or_else(|| {
                var("AZURE_OPENAI_RESOURCE_NAME")
                    .map(|r| format!("https://{r}.openai.azure.com/openai/v1"))
            })
            .unwrap_or_else(|| "https://api.openai.com/v1".into());
        let api_key = var("OPENAI_API_KEY")
            .or_else(|| var("AZURE_OPENAI_API_KEY"))
            .ok_or_else(|| ConfigError::Missing("OPENAI_API_KEY".into()))?;
        Ok(Self { api_base, api_key, request_timeout: Duration::from_secs(120) })
    }
}

pub(crate) fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseId(pub String);

impl std::fmt::Display for ResponseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl SafetyCheck {
    pub fn from_id(id: impl Into<String>) -> Self {
        Self { id: id.into(), code: String::new(), message: String::new() }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    DoubleClick,
    Move,
    Drag,
    Scroll,
    Type,
    Keypress,
    Wait,
    Screenshot,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::DoubleClick => "double_click",
            ActionKind::Move => "move",
            ActionKind::Drag => "drag",
            ActionKind::Scroll => "scroll",
            ActionKind::Type => "type",
            ActionKind::Keypress => "keypress",
            ActionKind::Wait => "wait",
            ActionKind::Screenshot => "screenshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CuaAction {
    Click { at: Option<LogicalPoint>, button: Option<String> },
    DoubleClick { at: Option<LogicalPoint>, button: Option<String> },
    Move { at: Option<LogicalPoint> },
    Drag { path: Vec<LogicalPoint>, button: Option<String> },
    Scroll { at: Option<LogicalPoint>, scroll_x: i64, scroll_y: i64 },
    Type { text: Option<String> },
    Keypress { keys: Vec<String> },
    Wait { duration_ms: Option<i64> },
    Screenshot,
    Unknown(String),
}

impl CuaAction {
    pub fn kind(&self) -> Option<ActionKind> {
        Some(match self {
            CuaAction::Click { .. } => ActionKind::Click,
            CuaAction::DoubleClick { .. } => ActionKind::DoubleClick,
            CuaAction::Move { .. } => ActionKind::Move,
            CuaAction::Drag { .. } => ActionKind::Drag,
            CuaAction::Scroll { .. } => ActionKind::Scroll,
            CuaAction::Type { .. } => ActionKind::Type,
            CuaAction::Keypress { .. } => ActionKind::Keypress,
            CuaAction::Wait { .. } => ActionKind::Wait,
            CuaAction::Screenshot => ActionKind::Screenshot,
            CuaAction::Unknown(_) => return None,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            CuaAction::Unknown(kind) => kind,
            other => other.kind().map(ActionKind::as_str).unwrap_or("unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedAction {
    pub call_id: String,
    pub action: CuaAction,
    pub pending_safety_checks: Vec<SafetyCheck>,
}

#[derive(Debug, Clone)]
pub struct CuaResponse {
    pub id: ResponseId,
    pub computer_call: Option<ProposedAction>,
    pub texts: Vec<String>,
}

impl CuaResponse {
    pub fn narration(&self) -> String {
        self.texts
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputerTool {
    pub display: Size,
    pub environment: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InputItem {
    System(String),
    User(String),
    ComputerCallOutput { call_id: String, observation: Observation },
}

#[derive(Clone, Debug, PartialEq)]
pub struct CuaRequest {
    pub model: String,
    pub previous_response_id: Option<ResponseId>,
    pub tool: Option<ComputerTool>,
    pub input: Vec<InputItem>,
    pub acknowledged_safety_checks: Vec<SafetyCheck>,
    pub max_output_tokens: Option<u32>,
}

impl CuaRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            previous_response_id: None,
            tool: None,
            input: Vec::new(),
            acknowledged_safety_checks: Vec::new(),
            max_output_tokens: None,
        }
    }

    pub fn initial(model: &str, tool: ComputerTool, guidance: Option<&str>, instruction: &str) -> Self {
        let mut req = Self::new(model).with_tool(tool);
        if let Some(g) = guidance.filter(|g| !g.trim().is_empty()) {
            req.input.push(InputItem::System(g.to_string()));
        }
        req.input.push(InputItem::User(instruction.to_string()));
        req
    }

    pub fn user_message(model: &str, tool: ComputerTool, previous: &ResponseId, text: &str) -> Self {
        let mut req = Self::new(model).with_tool(tool).with_previous(previous.clone());
        req.input.push(InputItem::User(text.to_string()));
        req
    }

    pub fn computer_output(
        model: &str,
        tool: ComputerTool,
        previous: &ResponseId,
        call_id: &str,
        observation: Observation,
        acknowledged: &[SafetyCheck],
    ) -> Self {
        let mut req = Self::new(model).with_tool(tool).with_previous(previous.clone());
        req.input.push(InputItem::ComputerCallOutput { call_id: call_id.to_string(), observation });
        req.acknowledge(acknowledged);
        req
    }

    pub fn with_tool(mut self, tool: ComputerTool) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_previous(mut self, previous: ResponseId) -> Self {
        self.previous_response_id = Some(previous);
        self
    }

    pub fn acknowledge(&mut self, checks: &[SafetyCheck]) {
        for check in checks {
            if !self.acknowledged_safety_checks.iter().any(|c| c.id == check.id) {
                self.acknowledged_safety_checks.push(check.clone());
            }
        }
    }

    pub fn has_computer_output(&self) -> bool {
        self.input.iter().any(|i| matches!(i, InputItem::ComputerCallOutput { .. }))
    }

    pub fn to_json(&self) -> Value {
        let input: Vec<Value> = self
            .input
            .iter()
            .map(|item| match item {
                InputItem::System(text) => json!({ "role": "system", "content": text }),
                InputItem::User(text) => json!({ "role": "user", "content": text }),
                InputItem::ComputerCallOutput { call_id, observation } => {
                    let mut v = json!({
                        "type": "computer_call_output",
                        "call_id": call_id,
                        "output": {
                            "type": "input_image",
                            "image_url": observation.data_url(),
                        }
                    });
                    if !self.acknowledged_safety_checks.is_empty() {
                        v["acknowledged_safety_checks"] = json!(self
                            .acknowledged_safety_checks
                            .iter()
                            .map(|c| json!({ "id": c.id, "code": c.code, "message": c.message }))
                            .collect::<Vec<_>>());
                    }
                    v
                }
            })
            .collect();

        let mut req = json!({
            "model": self.model,
            "truncation": "auto",
            "input": input,
        });
        if let Some(tool) = &self.tool {
            req["tools"] = json!([{
                "type": "computer_use_preview",
                "display_width": tool.display.width,
                "display_height": tool.display.height,
                "environment": tool.environment,
            }]);
        }
        if let Some(prev) = &self.previous_response_id {
            req["previous_response_id"] = Value::String(prev.0.clone());
        }
        if let Some(max) = self.max_output_tokens {
            req["max_output_tokens"] = json!(max);
        }
        req
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn create(&self, request: &CuaRequest) -> Result<CuaResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    cfg: CuaConfig,
}

impl HttpTransport {
    pub fn new(cfg: CuaConfig) -> Result<Self, ConfigError> {
        if cfg.api_key.is_empty() {
            return Err(ConfigError::Missing("OPENAI_API_KEY".into()));
        }
        let http = Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid { name: "http client".into(), value: e.to_string() })?;
        Ok(Self { http, cfg })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create(&self, request: &CuaRequest) -> Result<CuaResponse, TransportError> {
        let url = format!("{}/responses", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&request.to_json())
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.map_err(classify_reqwest)?;
        if !status.is_success() {
            return Err(classify_status(status, retry_after, &text));
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| {
            TransportError::new(ErrorClass::Fatal, format!("failed to parse response JSON: {e}"))
        })?;
        parse_response(&v)
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if let Some(status) = err.status() {
        return classify_status(status, None, &err.to_string());
    }
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        return TransportError::new(ErrorClass::Transient, format!("connection error: {err}"));
    }
    TransportError::new(ErrorClass::Fatal, err.to_string())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TransportError {
    let message = format!("HTTP {}: {}", status.as_u16(), body);
    match status.as_u16() {
        429 => TransportError::rate_limited(message, retry_after),
        500 | 502 | 503 | 504 => TransportError::new(ErrorClass::ServerError, message),
        400 => {
            let ids = unacknowledged_safety_check_ids(body);
            if ids.is_empty() {
                TransportError::new(ErrorClass::Fatal, message)
            } else {
                TransportError::safety_required(message, ids)
            }
        }
        _ => TransportError::new(ErrorClass::Fatal, message),
    }
}

pub fn unacknowledged_safety_check_ids(message: &str) -> Vec<String> {
    if !message.contains("unacknowledged safety check") {
        return Vec::new();
    }
    let mut ids: Vec<String> = Vec::new();
    for (i, part) in message.split('\'').enumerate() {
        if i % 2 == 1 && part.starts_with("cu_sc_") && !ids.iter().any(|x| x == part) {
            ids.push(part.to_string());
        }
    }
    ids
}

pub fn parse_response(v: &Value) -> Result<CuaResponse, TransportError> {
    let id = v
        .get("id")
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| ResponseId(s.to_string()))
        .ok_or_else(|| TransportError::new(ErrorClass::Fatal, "response is missing id"))?;

    let empty = Vec::new();
    let outputs = v.get("output").and_then(|x| x.as_array()).unwrap_or(&empty);

    let mut computer_call = None;
    let mut texts = Vec::new();
    for o in outputs {
        match o.get("type").and_then(|x| x.as_str()) {
            Some("computer_call") if computer_call.is_none() => {
                computer_call = Some(decode_computer_call(o)?);
            }
            Some("message") => {
                let parts = o.get("content").and_then(|x| x.as_array()).unwrap_or(&empty);
                for part in parts {
                    if part.get("type").and_then(|x| x.as_str()) != Some("output_text") {
                        continue;
                    }
                    if let Some(text) = part.get("text").and_then(|x| x.as_str()) {
                        if !text.is_empty() {
                            texts.push(text.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(CuaResponse { id, computer_call, texts })
}

fn decode_computer_call(o: &Value) -> Result<ProposedAction, TransportError> {
    let call_id = o
        .get("call_id")
        .and_then(|x| x.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::new(ErrorClass::Fatal, "computer_call is missing call_id"))?
        .to_string();
    let action = o.get("action").map(decode_action).unwrap_or(CuaAction::Unknown("missing".into()));
    let pending_safety_checks = match o.get("pending_safety_checks") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|c| serde_json::from_value::<SafetyCheck>(c.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                TransportError::new(ErrorClass::Fatal, format!("malformed pending_safety_checks: {e}"))
            })?,
        _ => Vec::new(),
    };
    Ok(ProposedAction { call_id, action, pending_safety_checks })
}

fn point(v: &Value) -> Option<LogicalPoint> {
    let x = v.get("x")?.as_i64()?;
    let y = v.get("y")?.as_i64()?;
    Some(LogicalPoint::new(x, y))
}

fn button(v: &Value) -> Option<String> {
    v.get("button").and_then(|x| x.as_str()).map(|s| s.to_string())
}

fn decode_action(v: &Value) -> CuaAction {
    let kind = v.get("type").and_then(|x| x.as_str()).unwrap_or("unknown");
    match kind {
        "screenshot" => CuaAction::Screenshot,
        "click" => CuaAction::Click { at: point(v), button: button(v) },
        "double_click" => CuaAction::DoubleClick { at: point(v), button: button(v) },
        "move" => CuaAction::Move { at: point(v) },
        "scroll" => CuaAction::Scroll {
            at: point(v),
            scroll_x: v.get("scroll_x").and_then(|x| x.as_i64()).unwrap_or(0),
            scroll_y: v.get("scroll_y").and_then(|x| x.as_i64()).unwrap_or(0),
        },
        "type" => CuaAction::Type { text: v.get("text").and_then(|x| x.as_str()).map(|s| s.to_string()) },
        "keypress" => CuaAction::Keypress {
            keys: v
                .get("keys")
                .and_then(|x| x.as_array())
                .map(|arr| arr.iter().filter_map(|k| k.as_str().map(|s| s.to_string())).collect())
                .unwrap_or_default(),
        },
        "drag" => CuaAction::Drag {
            path: v
                .get("path")
                .and_then(|x| x.as_array())
                .map(|arr| arr.iter().filter_map(point).collect())
                .unwrap_or_default(),
            button: button(v),
        },
        "wait" => CuaAction::Wait { duration_ms: v.get("duration_ms").and_then(|x| x.as_i64()) },
        other => CuaAction::Unknown(other.to_string()),
    }
}
