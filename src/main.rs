use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cua_pilot::confirmation::ModelClassifier;
use cua_pilot::escalation::SafetyAcknowledger;
use cua_pilot::session_log::{FileSessionLog, SessionLog, TracingSessionLog};
use cua_pilot::{
    ActionDispatcher, AgentConfig, AgentLoop, BrowserConfig, ChromiumComputer, Config, ConfirmationGate,
    ConfirmationPolicy, ConsoleEscalation, EscalationChannel, HttpTransport, RetryingClient, Terminal,
};

/// Drive a Chromium page with a computer-use model until the task is done.
#[derive(Parser, Debug)]
#[command(name = "cua-pilot", version)]
struct Cli {
    /// Task instruction for the assistant.
    #[arg(short, long, env = "TARGET_MESSAGE")]
    message: String,
    /// Overrides CUA_MAX_STEPS.
    #[arg(long)]
    max_steps: Option<u32>,
    #[arg(long)]
    start_url: Option<String>,
    #[arg(long)]
    headless: bool,
    /// Attach to a running Chromium instead of launching one.
    #[arg(long, env = "CHROME_WS_URL")]
    ws_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::from_env().context("loading configuration")?;
    if let Some(max_steps) = cli.max_steps {
        if max_steps == 0 {
            bail!("--max-steps must be at least 1");
        }
        cfg.max_steps = max_steps;
    }

    let browser_cfg = BrowserConfig { headless: cli.headless, ..Default::default() };
    let computer = match cli.ws_url.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(ws) => ChromiumComputer::connect(ws, browser_cfg.viewport).await?,
        None => ChromiumComputer::launch(browser_cfg).await?,
    };
    if let Some(url) = &cli.start_url {
        computer.goto(url).await.with_context(|| format!("opening {url}"))?;
    }
    let computer = Arc::new(computer);

    let escalation: Arc<dyn EscalationChannel> = Arc::new(ConsoleEscalation);
    let acknowledger = SafetyAcknowledger::new(cfg.auto_ack_safety_checks, escalation.clone());
    let transport = Arc::new(HttpTransport::new(cfg.cua.clone())?);
    let client = RetryingClient::new(transport, cfg.retry.clone()).with_safety_acknowledger(acknowledger.clone());

    let mut gate = ConfirmationGate::new(ConfirmationPolicy { auto_confirm: cfg.auto_confirm, ..Default::default() });
    if let Some(model) = &cfg.confirm_model {
        gate = gate.with_classifier(Arc::new(ModelClassifier::new(client.clone(), model.clone())));
    }

    let log: Arc<dyn SessionLog> = match &cfg.session_log {
        Some(path) => Arc::new(FileSessionLog::open(path, &cfg.model).await),
        None => Arc::new(TracingSessionLog),
    };

    let agent = AgentLoop::new(
        client,
        gate,
        ActionDispatcher::new(computer.clone(), computer),
        escalation,
        AgentConfig::from(&cfg),
    )
    .with_safety_acknowledger(acknowledger)
    .with_session_log(log);

    let report = agent.run(&cli.message).await;
    info!(
        run_id = %report.run_id,
        steps = report.steps,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "{:?}: {}",
        report.terminal,
        report.cause.as_deref().unwrap_or("")
    );
    if report.terminal == Terminal::FatalError {
        bail!(report.cause.unwrap_or_else(|| "run failed".into()));
    }
    Ok(())
}
