#![forbid(unsafe_code)]

//! `command-assist`: run interactive command-line tools under supervision.
//!
//! `run` attaches a session to the terminal: output is printed as it
//! arrives, detected prompts are answered from the terminal, and Ctrl-C or
//! SIGTERM terminates the child. `history` prints the recorded command log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use command_assist::history::{read_history, HistoryOutcome, HistoryRecord};
use command_assist::models::output::{EventFilter, SessionEvent, StreamSource};
use command_assist::models::session::{SessionHandle, SessionOutcome, SessionState, SpawnRequest};
use command_assist::{AppError, GlobalConfig, Result, SessionManager};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "command-assist",
    about = "Run interactive commands with prompt detection and history",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the history directory.
    #[arg(long, global = true)]
    history_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command attached to this terminal.
    Run {
        /// Working directory (defaults to the current directory).
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Channel to bind the session to.
        #[arg(long)]
        channel: Option<String>,

        /// Do not record this session to history.
        #[arg(long)]
        no_history: bool,

        /// Command and arguments; defaults to the configured executable.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Print recorded command history.
    History {
        /// Show at most this many of the most recent entries.
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Print raw JSONL records.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(dir) = args.history_dir {
        config.history_dir = dir;
    }

    match args.command {
        Command::Run {
            cwd,
            channel,
            no_history,
            argv,
        } => {
            if no_history {
                config.record_history = false;
            }
            let request = build_request(&config, cwd, channel, argv)?;
            let manager = SessionManager::new(config)?;
            let code = run_attached(&manager, request).await?;
            Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
        }
        Command::History { limit, json } => {
            print_history(&config, limit, json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_request(
    config: &GlobalConfig,
    cwd: Option<PathBuf>,
    channel: Option<String>,
    argv: Vec<String>,
) -> Result<SpawnRequest> {
    let working_directory = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir()
            .map_err(|err| AppError::Io(format!("cannot resolve current directory: {err}")))?,
    };

    let mut argv = argv.into_iter();
    let command = argv
        .next()
        .unwrap_or_else(|| config.engine.executable.clone());
    let mut request = SpawnRequest::new(command, working_directory).with_args(argv);
    if let Some(channel) = channel {
        request = request.with_channel(channel);
    }
    Ok(request)
}

/// Drive one session against the terminal and return the exit code to use.
async fn run_attached(manager: &SessionManager, request: SpawnRequest) -> Result<i32> {
    let (handle, mut events) = manager
        .start_subscribed(request, EventFilter::All)
        .await?;
    info!(%handle, "session started");

    let mut terminal = BufReader::new(tokio::io::stdin()).lines();
    let mut terminal_open = true;
    // Prompt text already shown; stripped when it reappears in output.
    let mut shown_prompt: Option<(StreamSource, String)> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut shutdown_seen = false;

    let outcome = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break manager.wait(handle).await?;
                };
                match event {
                    SessionEvent::Output(output) => {
                        let mut text = output.text.as_str();
                        if let Some((source, prompt)) = shown_prompt.take() {
                            if source == output.source {
                                if let Some(rest) = text.strip_prefix(prompt.as_str()) {
                                    text = rest.strip_prefix(' ').unwrap_or(rest);
                                }
                            } else {
                                shown_prompt = Some((source, prompt));
                            }
                        }
                        write_terminal(output.source, text).await;
                    }
                    SessionEvent::Prompt(prompt) => {
                        write_terminal(prompt.source, &format!("{} ", prompt.prompt_text)).await;
                        shown_prompt = Some((prompt.source, prompt.prompt_text));
                    }
                    SessionEvent::Finished(outcome) => break outcome,
                    SessionEvent::Warning { message, .. } => warn!(%handle, detail = %message, "session warning"),
                }
            }

            line = terminal.next_line(), if terminal_open => {
                match line {
                    Ok(Some(line)) => answer(manager, handle, line).await,
                    Ok(None) => terminal_open = false,
                    Err(err) => {
                        warn!(%err, "terminal input failed");
                        terminal_open = false;
                    }
                }
            }

            () = &mut shutdown, if !shutdown_seen => {
                shutdown_seen = true;
                info!(%handle, "shutdown signal received, terminating session");
                manager.terminate(handle).await?;
            }
        }
    };

    // Drain trailing warnings such as a failed history write.
    while let Some(event) = events.recv().await {
        if let SessionEvent::Warning { message, .. } = event {
            warn!(%handle, detail = %message, "session warning");
        }
    }

    Ok(exit_code(&outcome))
}

async fn answer(manager: &SessionManager, handle: SessionHandle, line: String) {
    let result = match manager.state(handle).await {
        Ok(SessionState::WaitingForInput) => manager.send_input(handle, line).await,
        Ok(_) => manager.send_anyway(handle, line).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(%handle, %err, "input not delivered");
    }
}

async fn write_terminal(source: StreamSource, text: &str) {
    let written = match source {
        StreamSource::Stdout => {
            let mut out = tokio::io::stdout();
            match out.write_all(text.as_bytes()).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            }
        }
        StreamSource::Stderr => {
            let mut out = tokio::io::stderr();
            match out.write_all(text.as_bytes()).await {
                Ok(()) => out.flush().await,
                Err(err) => Err(err),
            }
        }
    };
    if let Err(err) = written {
        warn!(%err, "failed to write to terminal");
    }
}

fn exit_code(outcome: &SessionOutcome) -> i32 {
    match (outcome.state, outcome.exit_code) {
        (_, Some(code)) => code,
        (SessionState::Terminated, None) => 130,
        _ => 1,
    }
}

fn print_history(config: &GlobalConfig, limit: usize, json: bool) -> Result<()> {
    let records = read_history(&config.history_dir)?;
    let skip = records.len().saturating_sub(limit);

    for record in records.iter().skip(skip) {
        if json {
            println!("{}", serde_json::to_string(record)?);
        } else {
            println!("{}", history_line(record));
        }
    }
    Ok(())
}

fn history_line(record: &HistoryRecord) -> String {
    let outcome = match record.outcome {
        HistoryOutcome::Completed => "completed",
        HistoryOutcome::Failed => "failed",
        HistoryOutcome::Terminated => "terminated",
    };
    let exit = record
        .exit_code
        .map_or_else(|| "-".to_owned(), |code| code.to_string());
    format!(
        "{} {outcome:<10} exit={exit:<3} {} $ {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.working_directory.display(),
        record.command_line
    )
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // Logs share the terminal with child output, so they go to stderr.
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
