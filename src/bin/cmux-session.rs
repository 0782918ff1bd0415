//! cmux-session binary entry point.
//!
//! Terminal front end for a sandbox session: run a script, push files,
//! attach the interactive shell and inspect the backend.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::{Event, EventStream, KeyCode, KeyEventKind};
use crossterm::terminal;
use futures::StreamExt;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use cmux_session::terminal::{is_detach_prefix, key_event_to_bytes};
use cmux_session::{
    CallerIdentity, ClientConfig, Scrollback, SessionController, SessionId, StdoutSurface,
};

const ATTACH_TIMEOUT_SECS: u64 = 10;

/// Client for the cmux code execution sandbox.
#[derive(Parser, Debug)]
#[command(name = "cmux-session")]
#[command(about = "Run code and attach a shell in a cmux sandbox session", version)]
struct Cli {
    /// Sandbox backend address
    #[arg(long, global = true, env = "CMUX_API_ADDRESS")]
    api: Option<String>,

    /// Identity attached to execute requests and shell commands
    #[arg(long, global = true, env = "CMUX_USER_EMAIL")]
    email: Option<String>,

    /// Session to use; a new one is generated when omitted
    #[arg(long, global = true, env = "CMUX_SESSION_ID")]
    session: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a script and print its output
    Run {
        path: PathBuf,

        /// Save generated files into this directory
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },

    /// Push a file into the session workspace
    Push {
        path: PathBuf,

        /// Name in the workspace (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Attach an interactive shell (Ctrl+B then D to detach)
    Attach {
        /// Load this file into the buffer so it is synced on connect
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Check that the backend is up
    Health,

    /// List files in the session workspace
    Files {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download a file from the session workspace
    Fetch {
        /// Name in the workspace
        name: String,

        /// Directory to save into (defaults to the current directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    // Raw mode shares the screen with the logs
    let default_level = match cli.command {
        Command::Attach { .. } => Level::WARN,
        _ => Level::INFO,
    };
    let filter = if cli.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = ClientConfig::from_env()?;
    if let Some(api) = &cli.api {
        config = config.with_api_address(api)?;
    }
    if let Some(email) = &cli.email {
        config = config.with_identity(CallerIdentity::email(email.as_str()));
    }
    let session = cli
        .session
        .as_deref()
        .map(SessionId::new)
        .unwrap_or_else(SessionId::generate);

    info!(
        api = %config.api_base_url,
        session_id = %session,
        "Using sandbox session"
    );

    match cli.command {
        Command::Run { path, save_dir } => {
            let controller =
                SessionController::connect(session, &config, Arc::new(Scrollback::new()))?;
            cmd_run(&controller, &path, save_dir.as_deref()).await
        }
        Command::Push { path, name } => {
            let controller =
                SessionController::connect(session, &config, Arc::new(Scrollback::new()))?;
            cmd_push(&controller, &path, name).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Attach { file } => {
            let controller =
                SessionController::connect(session, &config, Arc::new(StdoutSurface))?;
            cmd_attach(&controller, file.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => {
            let controller =
                SessionController::connect(session, &config, Arc::new(Scrollback::new()))?;
            let health = controller.health().await?;
            println!("status: {}", health.status);
            if let Some(service) = health.service {
                println!("service: {}", service);
            }
            if let Some(docker) = health.docker_available {
                println!("docker available: {}", docker);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Files { json } => {
            let controller =
                SessionController::connect(session, &config, Arc::new(Scrollback::new()))?;
            cmd_files(&controller, json).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Fetch { name, out } => {
            let controller =
                SessionController::connect(session, &config, Arc::new(Scrollback::new()))?;
            cmd_fetch(&controller, &name, out.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn read_source(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

async fn cmd_run(
    controller: &SessionController,
    path: &Path,
    save_dir: Option<&Path>,
) -> Result<ExitCode> {
    let source = read_source(path).await?;
    // The run pushes the same text before executing
    let _ = controller.on_buffer_changed(source);

    let report = match controller.run_requested().await {
        Ok(Some(report)) => report,
        Ok(None) => {
            eprintln!("Nothing to run: {} is empty", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => {
            match controller.state().last_run {
                Some(display) => eprintln!("{}", display.text),
                None => eprintln!("{}", e),
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    if report.display.is_error {
        eprint!("{}", report.display.text);
    } else {
        print!("{}", report.display.text);
    }
    if !report.display.text.ends_with('\n') {
        if report.display.is_error {
            eprintln!();
        } else {
            println!();
        }
    }

    for artifact in controller.artifacts().list() {
        match save_dir {
            Some(dir) => {
                let download = controller.prepare_download(&artifact.name)?;
                let saved = download
                    .save_into(dir)
                    .await
                    .with_context(|| format!("Failed to save {}", artifact.name))?;
                eprintln!("Saved {} ({})", saved.display(), download.mime_type);
            }
            None => eprintln!("Generated {} ({})", artifact.name, artifact.mime_type),
        }
    }

    Ok(if report.display.is_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_push(controller: &SessionController, path: &Path, name: Option<String>) -> Result<()> {
    let content = read_source(path).await?;
    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive a file name from {}", path.display()))?,
    };

    controller.push_file(&name, &content).await?;
    println!(
        "Pushed {} ({} bytes) to session {}",
        name,
        content.len(),
        controller.session_id()
    );
    Ok(())
}

async fn cmd_files(controller: &SessionController, json: bool) -> Result<()> {
    let Some(listing) = controller.list_files().await? else {
        println!("No workspace for session {}", controller.session_id());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if listing.files.is_empty() {
        println!("No files");
        return Ok(());
    }

    println!("{:<40} {:>10} {:<12}", "NAME", "SIZE", "MODIFIED");
    println!("{}", "-".repeat(64));
    for file in &listing.files {
        println!("{:<40} {:>10} {:<12}", file.name, file.size, file.modified);
    }
    Ok(())
}

async fn cmd_fetch(controller: &SessionController, name: &str, out: Option<&Path>) -> Result<()> {
    let download = controller.download_workspace_file(name).await?;
    let dir = out.unwrap_or_else(|| Path::new("."));
    let saved = download
        .save_into(dir)
        .await
        .with_context(|| format!("Failed to save {}", name))?;
    println!(
        "Saved {} ({}, {} bytes)",
        saved.display(),
        download.mime_type,
        download.bytes.len()
    );
    Ok(())
}

async fn cmd_attach(controller: &SessionController, file: Option<&Path>) -> Result<()> {
    if let Some(path) = file {
        let source = read_source(path).await?;
        let _ = controller.on_buffer_changed(source);
    }

    controller.start()?;
    controller
        .terminal()
        .wait_until_open(std::time::Duration::from_secs(ATTACH_TIMEOUT_SECS))
        .await?;

    eprintln!(
        "Attached to session {} (Ctrl+B then D to detach, Ctrl+L to clear)",
        controller.session_id()
    );

    terminal::enable_raw_mode()?;
    let result = forward_keys(controller).await;
    terminal::disable_raw_mode()?;
    controller.stop().await;

    match result {
        Ok(()) => eprintln!("\nDetached from session {}", controller.session_id()),
        Err(e) => eprintln!("\nError: {:#}", e),
    }
    Ok(())
}

/// Pump key presses into the shell until `Ctrl+B d`.
async fn forward_keys(controller: &SessionController) -> Result<()> {
    let mut events = EventStream::new();
    let mut detach_prefix = false;

    while let Some(event) = events.next().await {
        let Event::Key(key) = event.context("Failed to read terminal event")? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        if detach_prefix {
            detach_prefix = false;
            if matches!(key.code, KeyCode::Char('d') | KeyCode::Char('D')) {
                return Ok(());
            }
            // Not a detach, pass the prefix through
            send(controller, "\x02");
        }

        if is_detach_prefix(&key) {
            detach_prefix = true;
            continue;
        }

        let bytes = key_event_to_bytes(&key);
        if !bytes.is_empty() {
            send(controller, &String::from_utf8_lossy(&bytes));
        }
    }
    Ok(())
}

fn send(controller: &SessionController, data: &str) {
    // Keys typed while reconnecting are dropped; the notices say why
    if let Err(e) = controller.send_terminal_input(data) {
        debug!(error = %e, "Terminal input dropped");
    }
}
