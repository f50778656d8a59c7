//! webtty CLI - opens a remote terminal session on the current terminal.
//!
//! This is the main binary entry point. See the `webtty` library for the
//! session machinery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::sync::Notify;

use webtty::constants::ADMISSION_STATE_FILE;
use webtty::protocol::{COMPILER_OPTION_KEY, IDE_CONTENT_KEY, IDE_LANG_KEY};
use webtty::session::{FileStore, RECONNECT_DISABLED};
use webtty::terminal::{forward_injected_input, StdioSurface};
use webtty::transport::WebSocketTransportFactory;
use webtty::{
    Config, JsonlTelemetry, NullTelemetry, Session, SessionAdmission, SessionController,
    SessionState, TelemetrySink,
};

// CLI
#[derive(Parser)]
#[command(name = "webtty")]
#[command(version)]
#[command(about = "Terminal client for webtty remote sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a session on this terminal (detach with Ctrl-])
    Connect(ConnectArgs),
    /// Print the effective configuration
    Config,
}

#[derive(clap::Args)]
struct ConnectArgs {
    /// Page URL of the server (defaults to the configured server_url)
    url: Option<String>,
    /// Query-string style arguments for the remote command
    #[arg(long, default_value = "")]
    arguments: String,
    /// Authentication token sent in the handshake
    #[arg(long, default_value = "")]
    token: String,
    /// Extra payload entries (values are parsed as JSON when possible)
    #[arg(long = "payload", value_name = "KEY=VALUE")]
    payload: Vec<String>,
    /// Language of a compile-and-run session
    #[arg(long, requires = "content_file")]
    lang: Option<String>,
    /// Source file of a compile-and-run session
    #[arg(long, requires = "lang")]
    content_file: Option<PathBuf>,
    /// Compiler option for a compile-and-run session
    #[arg(long)]
    compiler_option: Option<String>,
    /// Peer identifier the session is opened for
    #[arg(long)]
    jid: Option<String>,
    /// Reconnect delay in seconds (servers may enable it later)
    #[arg(long)]
    reconnect: Option<f64>,
    /// File or FIFO whose contents are typed into the session
    #[arg(long, value_name = "PATH")]
    input_file: Option<PathBuf>,
}

impl ConnectArgs {
    fn payload(&self) -> Result<Map<String, Value>> {
        let mut payload = Map::new();
        for entry in &self.payload {
            let (key, value) = entry
                .split_once('=')
                .with_context(|| format!("payload entry {entry:?} is not KEY=VALUE"))?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
            payload.insert(key.to_string(), value);
        }

        if let (Some(lang), Some(path)) = (&self.lang, &self.content_file) {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            payload.insert(IDE_LANG_KEY.to_string(), Value::from(lang.as_str()));
            payload.insert(IDE_CONTENT_KEY.to_string(), Value::from(content));
        }
        if let Some(option) = &self.compiler_option {
            payload.insert(COMPILER_OPTION_KEY.to_string(), Value::from(option.as_str()));
        }
        Ok(payload)
    }

    fn session(&self) -> Result<Session> {
        let mut session = Session::new(&self.arguments, &self.token, self.payload()?);
        session.reconnect_seconds = self.reconnect.unwrap_or(RECONNECT_DISABLED);
        if let Some(jid) = &self.jid {
            session = session.with_peer_id(jid);
        }
        Ok(session)
    }
}

fn telemetry_sink(config: &Config) -> Result<Box<dyn TelemetrySink>> {
    match &config.telemetry_path {
        Some(path) => {
            let sink = JsonlTelemetry::create(path)?;
            log::info!(
                "[telemetry] Recording session {} to {}",
                sink.session_id(),
                sink.path().display()
            );
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(NullTelemetry)),
    }
}

fn run_connect(args: &ConnectArgs) -> Result<()> {
    let config = Config::load()?;
    let page_url = args.url.clone().unwrap_or_else(|| config.server_url.clone());
    let session = args.session()?;
    let factory = WebSocketTransportFactory::new(&page_url);
    let admission_path = Config::config_dir()?.join(ADMISSION_STATE_FILE);
    let admission = SessionAdmission::new(config.max_sessions, config.session_window_minutes)
        .with_store(Arc::new(FileStore::new(admission_path)));
    let telemetry = telemetry_sink(&config)?;

    log::info!("webtty v{} connecting to {}", env!("CARGO_PKG_VERSION"), factory.url());

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    // Detach key, Ctrl-C and SIGTERM all end up here
    let stop = Arc::new(Notify::new());
    let signal_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || signal_stop.notify_one())
        .context("failed to install signal handler")?;

    // Sessions opened for a peer are not re-shared
    let shareable = args.jid.is_none();
    let last_peer: Arc<Mutex<Option<String>>> = Arc::default();
    let peer_slot = Arc::clone(&last_peer);
    let share_config = config.clone();

    let final_state = runtime.block_on(async {
        let mut surface = StdioSurface::new()?;
        let detach_stop = Arc::clone(&stop);
        surface.on_detach(Box::new(move || detach_stop.notify_one()));
        if let Some(path) = &args.input_file {
            // Opening a FIFO blocks until a writer shows up
            let input_path = path.clone();
            let events = surface.event_bus();
            std::thread::Builder::new()
                .name("webtty-inject-open".into())
                .spawn(move || match std::fs::File::open(&input_path) {
                    Ok(file) => {
                        if let Err(e) = forward_injected_input(file, events) {
                            log::warn!("[terminal] {e:#}");
                        }
                    }
                    Err(e) => log::warn!(
                        "[terminal] Cannot open input file {}: {e}",
                        input_path.display()
                    ),
                })
                .context("failed to spawn input file reader")?;
        }

        let mut handle = SessionController::new(
            session,
            Box::new(surface),
            Box::new(factory),
            admission,
        )
        .telemetry(telemetry)
        .options(config.controller_options())
        .on_peer_id(Box::new(move |jid| {
            if !shareable || jid.is_empty() {
                return;
            }
            if let Some(url) = share_config.share_url(jid) {
                log::info!("[session] Share link: {url}");
            }
            *peer_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(jid.to_string());
        }))
        .start();

        let state = tokio::select! {
            state = handle.closed() => state,
            () = stop.notified() => {
                log::info!("Detach requested");
                SessionState::Disposed
            }
        };
        handle.shutdown().await;
        anyhow::Ok(state)
    })?;

    println!();
    if let Some(jid) = last_peer.lock().unwrap_or_else(PoisonError::into_inner).as_deref() {
        if let Some(url) = config.share_url(jid) {
            println!("Share link: {url}");
        }
    }

    if final_state == SessionState::Denied {
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    // File logging so log lines don't interleave with the remote terminal
    // Use WEBTTY_LOG_FILE or <config dir>/webtty.log
    let log_path = if let Ok(path) = std::env::var("WEBTTY_LOG_FILE") {
        PathBuf::from(path)
    } else {
        Config::config_dir()?.join("webtty.log")
    };
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;

    // Set up panic hook to log panics and ensure terminal cleanup
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        let _ = crossterm::terminal::disable_raw_mode();
        default_hook(panic_info);
    }));

    let cli = Cli::parse();

    match cli.command {
        Commands::Connect(args) => run_connect(&args)?,
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
