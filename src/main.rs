use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use queenlive_core::events::SessionEvent;
use queenlive_core::settings::{load_settings, load_settings_from_path, ClientSettings};
use queenlive_core::{Role, Uid};
use queenlive_session::{HeadlessEngine, LogSurface, MembershipConfig, SessionOrchestrator, UiState};
use queenlive_signaling::{ControlPlane, HttpControlPlane, ReliableControlPlane, RetryConfig, SignalingClient};
use queenlive_telemetry::{init_telemetry, parse_level, RecentLog, RecentRecord, TelemetryConfig, TelemetryGuard};
use tracing::Level;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "queenlive", version, about = "Headless live-room client")]
struct Cli {
    /// Settings file (defaults to ~/.queenlive/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit JSON log lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Debug logging for the session and signaling crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join the room and chat from stdin
    Join {
        #[arg(long, default_value = "audience")]
        role: Role,
        /// Participant uid (hosts default to the configured host uid, audience to a random one)
        #[arg(long)]
        uid: Option<u32>,
        /// Base URL of the token/orchestration service
        #[arg(long)]
        server: Option<String>,
        /// Base URL of the chat relay, if different from --server
        #[arg(long)]
        socket: Option<String>,
        /// Chat/stream room
        #[arg(long)]
        stream: Option<String>,
    },
    /// Print the effective settings
    Settings,
}

/// One line typed by the user.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Chat(String),
    Join,
    Leave,
    YoutubeStart,
    YoutubeStop,
    State,
    Warnings,
    Resend,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Input::Chat(line.to_string()));
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    Some(match words.as_slice() {
        ["/join"] => Input::Join,
        ["/leave"] => Input::Leave,
        ["/youtube", "start"] => Input::YoutubeStart,
        ["/youtube", "stop"] => Input::YoutubeStop,
        ["/state"] => Input::State,
        ["/warnings"] => Input::Warnings,
        ["/resend"] => Input::Resend,
        ["/quit"] | ["/exit"] => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => load_settings().context("loading settings")?,
    };

    let telemetry = init_telemetry(telemetry_config(&settings, &cli));

    match cli.command {
        Command::Settings => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Join {
            role,
            uid,
            server,
            socket,
            stream,
        } => {
            if let Some(server) = server {
                settings.server_url = server;
            }
            if let Some(socket) = socket {
                settings.socket_url = socket;
            }
            if let Some(stream) = stream {
                settings.stream_id = Some(stream);
            }
            run_join(settings, role, uid.map(Uid), &telemetry).await
        }
    }
}

fn telemetry_config(settings: &ClientSettings, cli: &Cli) -> TelemetryConfig {
    let module_levels = if cli.verbose {
        ["queenlive_session", "queenlive_signaling"]
            .into_iter()
            .map(|module| (module.to_string(), Level::DEBUG))
            .collect()
    } else {
        Vec::new()
    };
    TelemetryConfig {
        log_level: parse_level(&settings.log_level),
        module_levels,
        json: settings.log_json || cli.json_logs,
        ..Default::default()
    }
}

async fn run_join(
    settings: ClientSettings,
    role: Role,
    uid: Option<Uid>,
    telemetry: &TelemetryGuard,
) -> anyhow::Result<()> {
    let timeout = Duration::from_millis(settings.request_timeout_ms);
    let http = HttpControlPlane::new(settings.server_url.clone(), timeout)?;
    let control: Arc<dyn ControlPlane> = Arc::new(ReliableControlPlane::new(http, RetryConfig::from(&settings.retry)));

    let signaling = Arc::new(
        SignalingClient::connect(settings.socket_url())
            .await
            .with_context(|| format!("connecting to chat relay at {}", settings.socket_url()))?,
    );

    // No real media: the configured host counts as live in the room.
    let engine = HeadlessEngine::new().with_publisher(settings.host_uid);
    let orchestrator = SessionOrchestrator::new(
        Arc::new(engine),
        control,
        signaling.clone(),
        Arc::new(LogSurface),
        MembershipConfig::from(&settings),
    );

    let printer = tokio::spawn(print_events(orchestrator.subscribe()));

    let session = orchestrator.join(role, uid).await.context("joining room")?;
    println!(
        "joined as {} (uid {}) on stream {}",
        session.username, session.local_uid, session.stream_id
    );
    let uid = Some(session.local_uid);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let Some(input) = parse_input(&line) else { continue };

        let result = match input {
            Input::Chat(text) => orchestrator.send_chat(&text),
            Input::Join => orchestrator.join(role, uid).await.map(|_| ()),
            Input::Leave => orchestrator.leave().await,
            Input::YoutubeStart => orchestrator
                .start_youtube_stream()
                .await
                .map(|link| println!("* live on YouTube: {link}")),
            Input::YoutubeStop => orchestrator.stop_rtmp_push().await,
            Input::State => {
                print_state(&orchestrator.snapshot(), telemetry.recent());
                Ok(())
            }
            Input::Warnings => {
                match telemetry.recent() {
                    Some(log) if !log.is_empty() => {
                        for record in log.snapshot() {
                            println!("{}", format_warning(&record));
                        }
                    }
                    _ => println!("* no warnings"),
                }
                Ok(())
            }
            Input::Resend => {
                let sent = orchestrator.chat().resend_unsent();
                println!("* resent {sent} message(s)");
                Ok(())
            }
            Input::Quit => break,
            Input::Unknown(cmd) => {
                eprintln!("unknown command: {cmd}");
                Ok(())
            }
        };
        if let Err(e) = result {
            eprintln!("error ({}): {e}", e.error_kind());
        }
    }

    if let Err(e) = orchestrator.leave().await {
        tracing::warn!(error = %e, "leave on exit failed");
    }
    signaling.close();
    printer.abort();
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ChatMessage { message } => println!("{}", message.display_line()),
        SessionEvent::ChatHistory { count } => println!("* {count} earlier messages"),
        SessionEvent::ChatCleared { .. } => println!("* chat cleared"),
        SessionEvent::ChatUnsent { message, error } => println!("! not sent ({error}): {message}"),
        SessionEvent::SystemMessage { text } => println!("* {text}"),
        SessionEvent::ParticipantPublished { uid, kind } => println!("* {uid} published {kind}"),
        SessionEvent::ParticipantUnpublished { uid } => println!("* {uid} left the stage"),
        SessionEvent::BroadcastStopped => println!("* YouTube stream stopped"),
        SessionEvent::Left { uid } => println!("* left the room as {uid}"),
        SessionEvent::PhaseChanged { .. }
        | SessionEvent::Joined { .. }
        | SessionEvent::JoinFailed { .. }
        | SessionEvent::VideoStarted
        | SessionEvent::BroadcastStarted { .. } => {}
    }
}

fn format_warning(record: &RecentRecord) -> String {
    let mut line = format!("{:<5} {}: {}", record.level.to_string(), record.target, record.message);
    if !record.fields.is_empty() {
        line.push_str(" (");
        line.push_str(&record.fields);
        line.push(')');
    }
    line
}

fn print_state(ui: &UiState, warnings: Option<&RecentLog>) {
    println!("phase:         {}", ui.phase);
    if let (Some(role), Some(username)) = (ui.role, &ui.username) {
        println!("you:           {username} ({role})");
    }
    println!("video started: {}", ui.video_started);
    match (&ui.youtube_link, &ui.converter_id) {
        (Some(link), Some(converter)) => println!("youtube:       {link} (converter {converter})"),
        _ if ui.loading => println!("youtube:       starting..."),
        _ => println!("youtube:       off"),
    }
    for target in &ui.render_targets {
        println!("tile:          {}", target.label());
    }
    for p in &ui.participants {
        println!("participant:   {} audio={} video={}", p.uid, p.has_audio, p.has_video);
    }
    println!("chat:          {} messages, {} unsent", ui.chat.len(), ui.unsent);
    if let Some(log) = warnings {
        println!("warnings:      {} (see /warnings)", log.len());
    }
}
