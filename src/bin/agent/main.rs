mod face;

use anyhow::{Context, Result};
use autoapply::artifacts::{ArtifactSink, FsSink, RunReport};
use autoapply::brain::OpenAiDecider;
use autoapply::config::LoggingConfig;
use autoapply::hands::BrowserSession;
use autoapply::profile::{ConfigProfile, Masker, ProfileProvider};
use autoapply::{Config, ProgressEvent, RunControl, RunLoop, RunRequest, RunResult};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "agent", version, about = "Fills in job applications in Chrome")]
struct Cli {
    /// Configuration file (default: ./config.yaml, then the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply to one job posting.
    Run {
        url: String,
        /// Profile YAML replacing the `profile` section of the config.
        #[arg(long)]
        profile: Option<PathBuf>,
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Per-action timeout.
        #[arg(long)]
        timeout_ms: Option<u64>,
        #[arg(long)]
        headless: bool,
    },
    /// Serve the dashboard and the runs API.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Validate configuration and profile.
    Check {
        #[arg(long)]
        profile: Option<PathBuf>,
    },
    /// Summarise a finished run directory.
    Report { run_dir: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };
    let _guard = init_tracing(&config.logging);

    match dispatch(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let (file_layer, guard) = match &logging.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "autoapply.log".into());
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn dispatch(command: Command, mut config: Config) -> Result<u8> {
    match command {
        Command::Run {
            url,
            profile,
            max_iterations,
            timeout_ms,
            headless,
        } => {
            if headless {
                config.browser.headless = true;
            }
            let mut request = RunRequest::new(url);
            request.profile_ref = profile;
            request.max_iterations = max_iterations;
            request.timeout_ms = timeout_ms;

            let control = RunControl::new();
            let on_interrupt = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    on_interrupt.cancel();
                }
            });

            let sink: Arc<dyn ArtifactSink> = Arc::new(FsSink::new(
                config.automation.artifacts_dir.clone(),
                config.logging.save_snapshots,
            ));
            let result = execute_run(&config, &request, control, sink, None).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(&result))
        }
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            face::serve(config).await?;
            Ok(0)
        }
        Command::Check { profile } => check(config, profile.as_deref()),
        Command::Report { run_dir } => {
            let report = RunReport::load(&run_dir).with_context(|| format!("reading {}", run_dir.display()))?;
            print_report(&report);
            Ok(report.result.map(|r| exit_code(&r)).unwrap_or(1))
        }
    }
}

fn exit_code(result: &RunResult) -> u8 {
    u8::try_from(result.status.exit_code()).unwrap_or(1)
}

fn resolved_config(config: &Config, profile_ref: Option<&Path>) -> Result<Config> {
    let config = match profile_ref {
        Some(path) => config.clone().with_profile_file(path)?,
        None => config.clone(),
    };
    config.validate()?;
    Ok(config)
}

fn provider_for(config: &Config) -> Arc<dyn ProfileProvider> {
    Arc::new(ConfigProfile::from_env(
        config.profile.clone(),
        &config.credentials.password_env_var,
    ))
}

/// Launches a browser for one run and drives it to a terminal status.
pub(crate) async fn execute_run(
    config: &Config,
    request: &RunRequest,
    control: RunControl,
    sink: Arc<dyn ArtifactSink>,
    events: Option<broadcast::Sender<ProgressEvent>>,
) -> Result<RunResult> {
    let config = resolved_config(config, request.profile_ref.as_deref())?;
    let provider = provider_for(&config);
    if provider.password().is_none() {
        warn!(
            env = %config.credentials.password_env_var,
            "no password configured, sign-in pages will stall"
        );
    }
    let masker = Masker::for_provider(provider.as_ref(), config.logging.mask_secrets);

    let browser = config.browser.clone();
    let action_timeout = Duration::from_millis(request.timeout_ms.unwrap_or(config.automation.action_timeout_ms));
    let session = tokio::task::spawn_blocking(move || BrowserSession::launch(&browser, action_timeout))
        .await
        .context("browser launch task failed")??;

    let mut run_loop = RunLoop::new(config.automation.clone(), provider, masker).with_sink(sink);
    if config.escalation.enabled {
        match OpenAiDecider::from_config(&config.escalation) {
            Ok(decider) => run_loop = run_loop.with_decider(Arc::new(decider)),
            Err(err) => warn!(error = %err, "escalation unavailable"),
        }
    }
    if let Some(events) = events {
        run_loop = run_loop.with_events(events);
    }

    let page = session.page();
    let network = session.network();
    let result = run_loop.run(&page, &network, request, &control).await;
    drop(page);
    if let Err(err) = tokio::task::spawn_blocking(move || drop(session)).await {
        warn!(error = %err, "browser shutdown failed");
    }
    Ok(result)
}

fn check(config: Config, profile: Option<&Path>) -> Result<u8> {
    let mut problems = Vec::new();
    let config = match profile {
        Some(path) => config.with_profile_file(path)?,
        None => config,
    };
    if let Err(err) = config.validate() {
        problems.push(err.to_string());
    }
    match &config.profile.resume_path {
        Some(path) if !path.is_file() => problems.push(format!("resume not found: {}", path.display())),
        Some(_) => {}
        None => problems.push("profile.resume_path is not set".into()),
    }
    if let Some(path) = &config.profile.cover_letter_path {
        if !path.is_file() {
            problems.push(format!("cover letter not found: {}", path.display()));
        }
    }
    if provider_for(&config).password().is_none() {
        problems.push(format!("{} is not set", config.credentials.password_env_var));
    }
    if config.escalation.enabled {
        if let Err(err) = OpenAiDecider::from_config(&config.escalation) {
            problems.push(err.to_string());
        }
    }

    if problems.is_empty() {
        info!("configuration ok");
        println!("ok");
        return Ok(0);
    }
    for problem in &problems {
        println!("- {problem}");
    }
    Ok(1)
}

fn print_report(report: &RunReport) {
    if let Some(start) = &report.start {
        println!("run      {}", start.run_id);
        println!("url      {}", start.url);
        println!("started  {}", start.started_at.to_rfc3339());
    }
    match &report.result {
        Some(result) => {
            println!("status   {:?} after {} iterations", result.status, result.iterations_used);
            println!("reason   {}", result.reason);
        }
        None => println!("status   unfinished"),
    }
    let path: Vec<String> = report.state_path().iter().map(|s| s.to_string()).collect();
    println!("states   {}", path.join(" -> "));
    println!(
        "actions  {} iterations, {} failed, {} snapshots",
        report.iterations.len(),
        report.failed_actions(),
        report.snapshots
    );
    if let Some(result) = &report.result {
        for field in &result.flagged {
            println!("flagged  {} = '{}' ({})", field.field, field.value, field.reason);
        }
    }
}
