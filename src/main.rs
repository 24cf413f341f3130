use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use realtime_voice::audio::convert::pcm16_encode;
use realtime_voice::audio::{CpalOutput, PlaybackLedger, PlaybackPipeline, WIRE_SAMPLE_RATE};
use realtime_voice::engine::{ControlEvent, Mailbox};
use realtime_voice::{Config, CpalDevices, EngineCommand, EngineEvent, VoiceEngine, WsConnector};

/// Voicemode - talk to a realtime speech model, interrupt it any time
#[derive(Parser)]
#[command(name = "voicemode", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Voice for synthesized speech (overrides config)
    #[arg(long)]
    voice: Option<String>,

    /// System instructions (overrides config)
    #[arg(long)]
    instructions: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice conversation (default)
    Chat,
    /// List audio devices
    Devices,
    /// Test speaker output through the playback pipeline
    TestSpeaker {
        /// Duration in seconds
        #[arg(short, long, default_value = "2")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,realtime_voice=info",
        1 => "info,realtime_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => chat(cli.voice, cli.instructions).await,
        Command::Devices => list_devices(),
        Command::TestSpeaker { duration } => test_speaker(duration).await,
    }
}

/// Run an interactive conversation until `q` or Ctrl-C
#[allow(clippy::future_not_send)]
async fn chat(voice: Option<String>, instructions: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(voice) = voice {
        config.session.voice = voice;
    }
    if let Some(instructions) = instructions {
        config.session.instructions = instructions;
    }
    config.validate()?;
    tracing::debug!(?config, "loaded configuration");

    let (mut engine, events) = VoiceEngine::new(config, WsConnector, CpalDevices);
    let (commands, commands_rx) = mpsc::channel(16);

    commands.send(EngineCommand::Connect).await?;

    tokio::spawn(print_events(events));
    tokio::spawn(read_keys(commands.clone()));

    let shutdown = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(EngineCommand::Shutdown).await;
        }
    });

    println!("Listening. Enter: i = interrupt, d = disconnect, c = connect, q = quit\n");

    // cpal streams are not Send, so the engine runs on this task
    engine.run(commands_rx).await;
    Ok(())
}

/// Map stdin lines to engine commands
async fn read_keys(commands: mpsc::Sender<EngineCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let command = match line.trim() {
            "i" | "" => EngineCommand::Interrupt,
            "d" => EngineCommand::Disconnect,
            "c" => EngineCommand::Connect,
            "q" => EngineCommand::Shutdown,
            other => {
                println!("unknown key {other:?} (i, d, c, q)");
                continue;
            }
        };
        if commands.send(command).await.is_err() || command == EngineCommand::Shutdown {
            break;
        }
    }
}

/// Render engine events to the terminal
async fn print_events(mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    // Length of the in-progress transcript already on screen
    let mut shown = 0;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::StateChanged(state) => {
                tracing::debug!(%state, "state changed");
            }
            EngineEvent::TranscriptUpdated { text } => {
                if shown == 0 {
                    print!("assistant: ");
                }
                if let Some(new) = text.get(shown..) {
                    print!("{new}");
                }
                shown = text.len();
                let _ = stdout.flush();
            }
            EngineEvent::AssistantUtterance { .. } => {
                println!();
                shown = 0;
            }
            EngineEvent::UserUtterance { text } => {
                if shown > 0 {
                    println!(" [interrupted]");
                    shown = 0;
                }
                println!("you: {text}");
            }
            EngineEvent::Error { message, fatal } => {
                if shown > 0 {
                    println!();
                    shown = 0;
                }
                if fatal {
                    println!("error: {message} (press c to reconnect, q to quit)");
                } else {
                    tracing::warn!("{message}");
                }
            }
        }
    }
}

/// List audio devices
fn list_devices() -> anyhow::Result<()> {
    println!("Audio devices (* = default):\n");
    for line in realtime_voice::audio::describe_devices()? {
        println!("  {line}");
    }
    Ok(())
}

/// Test speaker output
#[allow(clippy::future_not_send)]
async fn test_speaker(duration: u64) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for {duration} seconds\n");

    let (tx, mut mailbox) = mpsc::unbounded_channel();
    let ledger = Arc::new(PlaybackLedger::new(Mailbox::new(0, tx)));
    let output = CpalOutput::open(Arc::clone(&ledger))?;
    let mut playback = PlaybackPipeline::new(Box::new(output), Arc::clone(&ledger), 1.0);

    let frequency = 440.0_f32;
    let chunk = WIRE_SAMPLE_RATE as usize / 10;
    let total = WIRE_SAMPLE_RATE as usize * usize::try_from(duration)?;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f32 / WIRE_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    // Stream it the way speech arrives: many small chunks back to back
    for block in samples.chunks(chunk) {
        playback.play_chunk(&pcm16_encode(block));
    }
    println!(
        "Scheduled {} buffers ({} waiting for room)",
        ledger.pending(),
        playback.backlog()
    );

    let finished = async {
        while let Some(envelope) = mailbox.recv().await {
            match envelope.event {
                ControlEvent::PlaybackRoom => {
                    playback.refill();
                }
                ControlEvent::PlaybackDrained { .. } => return true,
                _ => {}
            }
        }
        false
    };
    let timeout = Duration::from_secs(duration + 2);
    if !matches!(tokio::time::timeout(timeout, finished).await, Ok(true)) {
        anyhow::bail!("playback did not finish ({} buffers pending)", ledger.pending());
    }

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: voicemode devices");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}
