use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speak_practice::{
    create_router, AppState, AudioBackendConfig, AudioCapture, AudioDevices, Config,
    DecodingOutput, DialoguePipeline, EndReason, FileBackend, HttpTurnClient,
    InMemorySessionStore, Playback, ScenarioContext, TurnConfig, TurnEvent, TurnMachine,
    TurnState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "speak-practice", about = "Spoken-language practice conversations")]
struct Cli {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/speak-practice")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dialogue server
    Serve,
    /// Hold a conversation with a server, speaking from WAV files
    Converse {
        /// Dialogue server URL
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
        /// Scenario title
        #[arg(long, default_value = "Ordering coffee")]
        title: String,
        #[arg(long, default_value = "barista")]
        ai_role: String,
        #[arg(long, default_value = "customer")]
        user_role: String,
        #[arg(long, default_value = "English")]
        language: String,
        /// WAV files spoken one per turn, in order
        #[arg(required = true)]
        utterances: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve => serve(cfg).await,
        Command::Converse {
            server,
            title,
            ai_role,
            user_role,
            language,
            utterances,
        } => {
            let scenario = ScenarioContext {
                description: format!("A {} helps a {}.", ai_role, user_role),
                title,
                ai_role,
                user_role,
                language,
            };
            converse(cfg, server, scenario, utterances).await
        }
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let provider = Arc::new(speak_practice::providers::OpenAiClient::from_env(
        cfg.provider.clone(),
    )?);
    let store = Arc::new(InMemorySessionStore::new());

    let pipeline = Arc::new(DialoguePipeline::new(
        provider.clone(),
        provider.clone(),
        provider,
        store,
        cfg.pipeline.clone(),
    ));

    let app = create_router(AppState::new(pipeline));
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn converse(
    cfg: Config,
    server: String,
    scenario: ScenarioContext,
    utterances: Vec<PathBuf>,
) -> Result<()> {
    let client = Arc::new(HttpTurnClient::new(server));
    let session = client.create_session(scenario).await?;

    let devices = AudioDevices::new();
    let backend = FileBackend::new(AudioBackendConfig::from(&cfg.audio), utterances);
    let capture = AudioCapture::new(Box::new(backend), devices.clone());
    let playback = Arc::new(Playback::new(Arc::new(DecodingOutput::new()), devices));

    let handle = TurnMachine::spawn(
        TurnConfig {
            session_id: session.id.clone(),
            vad: cfg.vad.clone(),
            fallback_reply: cfg.client.fallback_reply.clone(),
        },
        capture,
        playback,
        client.clone(),
    );

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TurnEvent::Exchange {
                    user_text,
                    reply_text,
                    feedback,
                    ..
                } => {
                    println!("you: {}", user_text);
                    for item in feedback {
                        println!("    {:?}: {}", item.category, item.suggestion);
                    }
                    println!("ai:  {}", reply_text);
                }
                TurnEvent::LocalReply { text, .. } => println!("ai:  {}", text),
                TurnEvent::CaptureFailed { error } => warn!("Microphone unavailable: {}", error),
                _ => {}
            }
        }
    });

    handle.start().await?;

    tokio::select! {
        result = handle.wait_for_state(TurnState::Ended) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, ending conversation");
        }
    }

    let stats = handle.end().await?;
    printer.abort();

    // The server already knows when it finished or rejected the session
    if !matches!(
        stats.end_reason,
        Some(EndReason::ConversationFinished | EndReason::SessionClosed)
    ) {
        if let Err(e) = client.end_session(&session.id).await {
            warn!("Failed to end session {} on the server: {:#}", session.id, e);
        }
    }

    info!(
        "Conversation over: {} turns in {:.1}s ({:?})",
        stats.turns_completed, stats.duration_secs, stats.end_reason
    );

    Ok(())
}
