mod cli;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use forgeflow::config::ForgeConfig;
use forgeflow::engine::{InstanceEvent, InstanceHandle, SimulatedExecutor, WorkflowEngine};
use forgeflow::repository::{JsonFileRepository, WorkplanRepository, read_workplan};
use forgeflow::state_machine::HealthProbe;
use forgeflow::transport::{DelayQueue, Listener, PortRegistry};
use forgeflow::workplan::{Token, Workplan};
use forgeflow::{demo, logging};
use ui::InstanceProgress;

/// Port the simulated line controller connects to.
const LINE_CONTROLLER_PORT: u16 = 4840;

/// Time every simulated activity takes.
const ACTIVITY_DELAY: Duration = Duration::from_millis(150);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ForgeConfig::load_from(path)?,
        None => ForgeConfig::load()?,
    };
    logging::init(&config.log_filter, cli.verbose)?;

    match cli.command {
        Command::Validate { file } => validate(&file),
        Command::Run {
            file,
            fail,
            token,
            save_snapshot,
        } => {
            let mut workplan = read_workplan(&file)
                .with_context(|| format!("loading workplan {}", file.display()))?;
            if !workplan.is_released() {
                workplan.release()?;
            }
            let workplan = Arc::new(workplan);
            let handle = execute(Arc::clone(&workplan), &fail, &token, &config).await?;
            if save_snapshot {
                let repo = JsonFileRepository::new(&config.workplan_dir);
                repo.save(&workplan)?;
                repo.save_snapshot(&handle.snapshot())?;
                info!(dir = %repo.root().display(), instance = %handle.id(), "snapshot stored");
            }
            handle.completion().await?;
            Ok(())
        }
        Command::Demo { fail } => {
            let workplan = Arc::new(demo::assembly(config.join_inputs)?);
            let handle = execute(workplan, &fail, "pump-1", &config).await?;
            ui::print_snapshot(&handle.snapshot());
            handle.completion().await?;
            Ok(())
        }
        Command::ExportDemo { file } => {
            let workplan = demo::assembly(config.join_inputs)?;
            std::fs::write(&file, serde_json::to_string_pretty(&workplan)?)
                .with_context(|| format!("writing {}", file.display()))?;
            println!("Wrote {} v{} to {}", workplan.name, workplan.version, file.display());
            Ok(())
        }
    }
}

fn validate(file: &Path) -> Result<()> {
    let mut workplan = read_workplan(file)?;
    if workplan.is_released() {
        workplan.validate()?;
    } else {
        workplan.release()?;
    }
    println!(
        "{} v{}: {} connectors, {} steps, exits: {}",
        workplan.name,
        workplan.version,
        workplan.connectors().len(),
        workplan.steps().len(),
        workplan
            .exits()
            .map(|c| format!("{} ({})", c.name, c.classification))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

/// Run one instance with the simulated executor, streaming its events to
/// the terminal and to the line controller link. Terminal output is paced
/// by a delay queue.
async fn execute(
    workplan: Arc<Workplan>,
    fail: &[String],
    token: &str,
    config: &ForgeConfig,
) -> Result<InstanceHandle> {
    let link = connect_line_controller(config.reconnect_delay_ms).await?;
    let mut frames = link.accept("line-controller")?;

    let executor = fail.iter().fold(
        SimulatedExecutor::new(ACTIVITY_DELAY),
        |executor, step| executor.fail(step.as_str()),
    );
    let engine = WorkflowEngine::new(Arc::new(executor));
    let handle = engine.instantiate(Arc::clone(&workplan))?;
    let mut events = handle.subscribe();

    let (pacer, mut paced) = DelayQueue::new(Duration::from_millis(config.delay_queue_ms)).await?;
    pacer.start().await?;

    let progress = InstanceProgress::start(&workplan, handle.id());
    handle.start(Token::new(token))?;

    let mut queued = 0usize;
    let mut shown = 0usize;
    let mut open = true;
    let result = {
        let completion = handle.completion();
        tokio::pin!(completion);
        loop {
            tokio::select! {
                result = &mut completion => break result,
                event = events.recv(), if open => match event {
                    Ok(event) => {
                        pacer.enqueue(event).await?;
                        queued += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                    Err(RecvError::Closed) => open = false,
                },
                Some(event) = paced.recv() => {
                    show(&progress, &link, &event);
                    shown += 1;
                }
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        pacer.enqueue(event).await?;
        queued += 1;
    }
    while shown < queued {
        let Some(event) = paced.recv().await else {
            break;
        };
        show(&progress, &link, &event);
        shown += 1;
    }
    pacer.stop().await?;
    progress.complete(&result);

    let mut published = 0usize;
    while frames.try_recv().is_ok() {
        published += 1;
    }
    link.stop()?;
    info!(
        published,
        link = link.state_name(),
        instance = %handle.classification(),
        "instance finished"
    );
    Ok(handle)
}

fn show(progress: &InstanceProgress, link: &Listener, event: &InstanceEvent) {
    progress.event(event);
    if !link.is_available() {
        return;
    }
    match serde_json::to_vec(event) {
        Ok(frame) => {
            if let Err(err) = link.send(frame) {
                warn!(%err, "dropping frame for line controller");
            }
        }
        Err(err) => warn!(%err, "event could not be encoded"),
    }
}

/// Bring the line controller listener up, waiting out the reconnect delay.
async fn connect_line_controller(delay_ms: u64) -> Result<Listener> {
    let link = Listener::new(LINE_CONTROLLER_PORT, Arc::new(PortRegistry::default()))?;
    link.reconnect(delay_ms)?;
    tokio::time::timeout(Duration::from_millis(delay_ms + 1_000), async {
        while !link.is_available() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("line controller listener did not come up")?;
    info!(port = link.port(), state = link.state_name(), "line controller link up");
    Ok(link)
}
