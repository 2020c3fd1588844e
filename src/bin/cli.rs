//! CLI binary for murmur.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use murmur::audio::capture::CpalInput;
use murmur::audio::playback::CpalSink;
use murmur::stt::HttpTranscriptionClient;
use murmur::tts::HttpSynthesisClient;
use murmur::{ChatCollaborator, SessionEvent, VoiceConfig, VoiceMessage, VoiceSessionCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Murmur: voice capture and chunked speech playback for chat.
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Path to TOML configuration file (defaults to the platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to a daily-rotated file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Interactive voice session on stdin.
    Talk {
        /// Answer every utterance with its own transcript (exercises speech output).
        #[arg(long)]
        echo: bool,
    },

    /// List available audio devices.
    Devices,

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Talk { echo: false }) {
        Command::Talk { echo } => run_talk(config, echo).await,
        Command::Devices => list_devices(),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Tracing to stderr, plus an optional rolling file. The returned guard
/// flushes the file writer on drop.
fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("murmur=info,reqwest=warn"))
    };
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "murmur.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<VoiceConfig> {
    if let Some(path) = path {
        return Ok(VoiceConfig::from_file(path)?);
    }
    let default_path = VoiceConfig::default_config_path();
    if default_path.exists() {
        info!("loading config from {}", default_path.display());
        Ok(VoiceConfig::from_file(&default_path)?)
    } else {
        Ok(VoiceConfig::default())
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalInput::list_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalSink::list_devices()? {
        println!("  - {name}");
    }

    Ok(())
}

/// Chat stand-in for the terminal: prints what was heard, optionally echoing it back.
struct ConsoleChat {
    echo: bool,
}

#[async_trait]
impl ChatCollaborator for ConsoleChat {
    async fn send_message(&self, message: VoiceMessage) -> murmur::Result<Option<String>> {
        let confidence = message
            .confidence
            .map(|c| format!("{:.0}%", c * 100.0))
            .unwrap_or_else(|| "n/a".to_owned());
        println!(
            "you ({}, {}ms, confidence {confidence}): {}",
            message.detected_language.as_deref().unwrap_or("?"),
            message.audio_duration_ms,
            message.text
        );
        Ok(self.echo.then_some(message.text))
    }
}

async fn run_talk(mut config: VoiceConfig, echo: bool) -> anyhow::Result<()> {
    println!("murmur v{}", env!("CARGO_PKG_VERSION"));
    if echo {
        config.session.auto_speak = true;
    }

    let session = VoiceSessionCoordinator::new(
        config.clone(),
        Arc::new(CpalInput::new()),
        Arc::new(CpalSink::new(&config.audio)?),
        Arc::new(HttpTranscriptionClient::new(&config.transcription)?),
        Arc::new(HttpSynthesisClient::new(&config.synthesis)?),
        Arc::new(ConsoleChat { echo }),
    )
    .spawn();

    tokio::spawn(print_events(session.subscribe()));

    println!("\nCommands: r = record, s = stop recording, say <text>, x = stop speaking, q = quit\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down...");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();

        let result = match line {
            "" => Ok(()),
            "q" | "quit" => break,
            "r" => session.start_recording().await.map(|_| ()),
            "s" => session.stop_recording().await,
            "x" => session.stop_speaking().await,
            "c" => session.cancel().await,
            other => match other.strip_prefix("say ") {
                Some(text) => session.speak(text).await.map(|_| ()),
                None => {
                    println!("unknown command: {other}");
                    Ok(())
                }
            },
        };
        // Failures are already printed from the event stream.
        if let Err(e) = result {
            info!("command failed: {e}");
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged { state }) => println!("[{state}]"),
            Ok(SessionEvent::SpeechDetected { .. }) => println!("(listening...)"),
            Ok(SessionEvent::CaptureStopped { reason, .. }) => println!("(recording stopped: {reason:?})"),
            Ok(SessionEvent::AssistantReply { text, .. }) => println!("assistant: {text}"),
            Ok(SessionEvent::ChunkStarted { index, total, .. }) => {
                println!("(playing {}/{total})", index + 1);
            }
            Ok(SessionEvent::PartialPlayback { played, .. }) => {
                println!("(speech stopped after {played} chunk(s))");
            }
            Ok(SessionEvent::Error { message, .. }) => eprintln!("error: {message}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => info!("missed {n} session events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
