//! CLI binary for remdis.

use clap::{Parser, Subcommand};
use remdis::bus::Bus;
use remdis::config::RemdisConfig;
use remdis::dialogue::DialogueController;
use remdis::input::{UserInput, spawn_typed_input};
use remdis::intention::Intention;
use remdis::llm::ApiLlm;
use remdis::prompts::PromptSet;
use remdis::runtime::spawn_module;
use remdis::text_vap::TextVap;
use remdis::topics;
use remdis::ui::{UI_TOPICS, UiBridge, UiEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Remdis: real-time incremental spoken-dialogue system.
#[derive(Parser)]
#[command(name = "remdis", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the dialogue system with typed input on stdin.
    Chat,

    /// Validate the configuration and exit.
    CheckConfig,
}

fn main() {
    // Initialize tracing; override with RUST_LOG as needed.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remdis=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("remdis: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let command = cli.command.unwrap_or(Command::Chat);
    let code = match command {
        Command::CheckConfig => {
            println!("configuration OK");
            0
        }
        Command::Chat => match run_chat(config) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("remdis: {e}");
                e.exit_code()
            }
        },
    };
    std::process::exit(code);
}

fn load_config(path: Option<&std::path::Path>) -> remdis::Result<RemdisConfig> {
    match path {
        Some(p) => RemdisConfig::from_file(p),
        None => Ok(RemdisConfig::default()),
    }
}

fn run_chat(config: RemdisConfig) -> remdis::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| remdis::RemdisError::Bus(format!("runtime init: {e}")))?;
    runtime.block_on(chat(config))
}

async fn chat(config: RemdisConfig) -> remdis::Result<()> {
    println!("Remdis v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let prompts = PromptSet::load(&config.chatgpt.prompts)?;
    let bus = Bus::new(config.bus.buff_size);
    let cancel = CancellationToken::new();
    let llm = Arc::new(ApiLlm::new(&config.chatgpt));

    // Handle Ctrl+C.
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    // Supporting modules on the runtime.
    let intention = spawn_module(
        Intention::new(),
        &bus,
        Arc::clone(&config),
        &[topics::ASR_PARTIAL, topics::ASR_COMMIT, topics::TTS_AUDIO],
        cancel.clone(),
    );
    let text_vap = spawn_module(
        TextVap::new(llm.clone(), prompts.clone()),
        &bus,
        Arc::clone(&config),
        &[topics::ASR_PARTIAL, topics::ASR_COMMIT],
        cancel.clone(),
    );
    let ui_bridge = UiBridge::new(64);
    let mut ui_events = ui_bridge.subscribe();
    let ui = spawn_module(
        ui_bridge,
        &bus,
        Arc::clone(&config),
        &UI_TOPICS,
        cancel.clone(),
    );

    // Typed input from stdin stands in for the microphone/ASR pair.
    let (input_tx, input_rx) = mpsc::channel::<UserInput>(16);
    let typed_input = spawn_typed_input(bus.clone(), input_rx, cancel.clone());
    spawn_stdin_reader(input_tx, cancel.clone());

    // Print system turns as they stream.
    let printer_cancel = cancel.clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = printer_cancel.cancelled() => break,
                event = ui_events.recv() => match event {
                    Ok(UiEvent::NewText { role, text }) if role == "system" => {
                        println!("[system] {text}");
                    }
                    Ok(UiEvent::SystemState { concept: Some(concept), .. }) => {
                        println!("[concept] {concept}");
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    // The controller runs in the foreground.
    let controller = DialogueController::new(
        Arc::clone(&config),
        prompts,
        llm,
        bus.clone(),
        cancel.clone(),
    );

    println!("\nReady. Type a message and press Enter; Ctrl+C to quit.\n");
    controller.run().await?;

    let _ = typed_input.await;
    let _ = printer.await;
    intention.join().await;
    text_vap.join().await;
    ui.join().await;
    Ok(())
}

/// Forward stdin lines as typed user input.
fn spawn_stdin_reader(tx: mpsc::Sender<UserInput>, cancel: CancellationToken) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            line.clear();
            match stdin.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    cancel.cancel();
                    break;
                }
                Ok(_) => {
                    let text = line.trim().to_owned();
                    if text.is_empty() {
                        continue;
                    }
                    let input = UserInput {
                        text,
                        is_final: true,
                    };
                    if tx.blocking_send(input).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
