use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::coords::{ScaledPoint, Size};
use crate::dispatch::{ActionExecutor, MouseButton, Observation, PhysicalAction, ScreenCapture};
use crate::error::ActionExecutionError;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: Size,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: Size { width: 1280, height: 800 } }
    }
}

pub struct ChromiumComputer {
    page: Page,
    viewport: Size,
    _browser: OxideBrowser,
}

fn metrics(viewport: Size) -> Result<SetDeviceMetricsOverrideParams> {
    SetDeviceMetricsOverrideParams::builder()
        .width(viewport.width as i64)
        .height(viewport.height as i64)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow!(e))
}

fn cdp_button(button: MouseButton) -> CdpButton {
    match button {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle => CdpButton::Middle,
    }
}

fn point(p: ScaledPoint) -> Point {
    Point { x: p.x as f64, y: p.y as f64 }
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Fresh profile per run; Chromium refuses to share a locked one.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("cua-pilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.width, cfg.viewport.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        page.execute(metrics(cfg.viewport)?).await?;
        info!(width = cfg.viewport.width, height = cfg.viewport.height, "chromium launched");
        Ok(Self { page, viewport: cfg.viewport, _browser: browser })
    }

    pub async fn connect(ws_url: &str, viewport: Size) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        page.execute(metrics(viewport)?).await?;
        info!(ws_url, "attached to chromium");
        Ok(Self { page, viewport, _browser: browser })
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn mouse(&self, kind: DispatchMouseEventType, at: ScaledPoint, button: MouseButton, clicks: i64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(at.x as f64)
            .y(at.y as f64)
            .button(cdp_button(button))
            .click_count(clicks)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn click(&self, at: ScaledPoint, button: MouseButton, clicks: i64) -> Result<()> {
        self.page.move_mouse(point(at)).await?;
        for n in 1..=clicks {
            self.mouse(DispatchMouseEventType::MousePressed, at, button, n).await?;
            self.mouse(DispatchMouseEventType::MouseReleased, at, button, n).await?;
        }
        Ok(())
    }

    async fn drag(&self, path: &[ScaledPoint], button: MouseButton) -> Result<()> {
        let (first, rest) = path.split_first().ok_or_else(|| anyhow!("empty drag path"))?;
        self.page.move_mouse(point(*first)).await?;
        self.mouse(DispatchMouseEventType::MousePressed, *first, button, 1).await?;
        let mut last = *first;
        for p in rest {
            self.mouse(DispatchMouseEventType::MouseMoved, *p, button, 0).await?;
            last = *p;
        }
        self.mouse(DispatchMouseEventType::MouseReleased, last, button, 1).await
    }

    async fn scroll(&self, at: ScaledPoint, dx: i64, dy: i64) -> Result<()> {
        self.page.move_mouse(point(at)).await?;
        let cmd = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(at.x as f64)
            .y(at.y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(cmd).await?;
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> Result<()> {
        let js = keypress_script(keys)?;
        let eval = EvaluateParams::builder().expression(js).build().map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page.screenshot(ScreenshotParamsBuilder::default().full_page(false).build()).await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // viewport collapsed; force it and retry once
                    self.page.execute(metrics(self.viewport)?).await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }
}

fn dom_key(key: &str) -> &str {
    match key {
        "ctrl" => "Control",
        "alt" => "Alt",
        "shift" => "Shift",
        "meta" => "Meta",
        "enter" => "Enter",
        "esc" => "Escape",
        "tab" => "Tab",
        "space" => " ",
        "backspace" => "Backspace",
        "delete" => "Delete",
        "pageup" => "PageUp",
        "pagedown" => "PageDown",
        "home" => "Home",
        "end" => "End",
        "up" => "ArrowUp",
        "down" => "ArrowDown",
        "left" => "ArrowLeft",
        "right" => "ArrowRight",
        other => other,
    }
}

fn keypress_script(keys: &[String]) -> Result<String> {
    let mods = |name: &str| keys.iter().any(|k| k == name);
    let dom: Vec<&str> = keys.iter().map(|k| dom_key(k)).collect();
    let keys_json = serde_json::to_string(&dom)?;
    Ok(format!(
        r#"(function() {{
  const el = document.activeElement || document.body;
  const mods = {{ctrlKey: {}, altKey: {}, shiftKey: {}, metaKey: {}, bubbles: true}};
  const keys = {keys_json};
  for (const k of keys) el.dispatchEvent(new KeyboardEvent("keydown", Object.assign({{key: k}}, mods)));
  for (const k of keys.slice().reverse()) el.dispatchEvent(new KeyboardEvent("keyup", Object.assign({{key: k}}, mods)));
}})()"#,
        mods("ctrl"),
        mods("alt"),
        mods("shift"),
        mods("meta"),
    ))
}

fn exec_err(e: anyhow::Error) -> ActionExecutionError {
    ActionExecutionError(e.to_string())
}

#[async_trait]
impl ActionExecutor for ChromiumComputer {
    async fn execute(&self, action: &PhysicalAction) -> Result<(), ActionExecutionError> {
        debug!(?action, "chromium execute");
        let result = match action {
            PhysicalAction::Click { at, button } => self.click(*at, *button, 1).await,
            PhysicalAction::DoubleClick { at, button } => self.click(*at, *button, 2).await,
            PhysicalAction::Move { at } => self.page.move_mouse(point(*at)).await.map(|_| ()).map_err(|e| anyhow!(e)),
            PhysicalAction::Drag { path, button } => self.drag(path, *button).await,
            PhysicalAction::Scroll { at, scroll_x, scroll_y } => self.scroll(*at, *scroll_x, *scroll_y).await,
            PhysicalAction::Type { text } => self.type_text(text).await,
            PhysicalAction::Keypress { keys } => self.keypress(keys).await,
            PhysicalAction::Wait { duration } => {
                sleep(*duration).await;
                Ok(())
            }
        };
        result.map_err(exec_err)
    }
}

#[async_trait]
impl ScreenCapture for ChromiumComputer {
    async fn screen_size(&self) -> Result<Size, ActionExecutionError> {
        Ok(self.viewport)
    }

    async fn capture(&self) -> Result<Observation, ActionExecutionError> {
        let b64 = self.screenshot_b64().await.map_err(exec_err)?;
        Ok(Observation::png(b64))
    }
}
