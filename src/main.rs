use anyhow::{Context, Result};
use assistant_mux::cli::AppConfig;
use assistant_mux::history::{self, HistoryStore};
use assistant_mux::message_tracing::MessageTracer;
use assistant_mux::models::{ChatMessage, ProviderId};
use assistant_mux::providers::openai::SpeechVoice;
use assistant_mux::providers::transport::Transport;
use assistant_mux::providers::ProviderRegistry;
use assistant_mux::quota::QuotaTracker;
use assistant_mux::session::ChatSessionController;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "amux")]
#[command(about = "Assistant Mux - multi-provider streaming chat built in Rust", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.assistant-mux/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively; Ctrl+C stops the current response
    Chat {
        /// Assistant to talk to (defaults to the configured provider)
        #[arg(short, long)]
        provider: Option<ProviderId>,
        /// Model display name or id
        #[arg(short, long)]
        model: Option<String>,
        /// JPEG to attach to the first message (repeatable)
        #[arg(short, long)]
        image: Vec<PathBuf>,
        /// Continue a saved conversation
        #[arg(short, long)]
        session: Option<Uuid>,
    },
    /// List available assistants and models
    Providers,
    /// Manage saved conversations
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Solve a math problem from a photo
    Math {
        file: PathBuf,
        #[arg(short, long, value_enum, default_value_t = MathEngine::Chatgpt)]
        provider: MathEngine,
    },
    /// Text to speech
    Speech {
        text: String,
        #[arg(long, default_value = "alloy")]
        voice: SpeechVoice,
        #[arg(short, long, default_value = "speech.mp3")]
        out: PathBuf,
    },
    /// Summarize a PDF document
    Pdf { file: PathBuf },
    /// Summarize a video by URL
    Video { url: String },
    /// Write song lyrics
    Lyrics {
        prompt: String,
        #[arg(short, long, default_value = "Pop")]
        style: String,
    },
    /// Generate an image
    Image {
        prompt: String,
        #[arg(short, long, default_value = "1:1")]
        aspect_ratio: String,
        #[arg(short, long, default_value = "photographic")]
        style: String,
        #[arg(short, long, default_value = "image.png")]
        out: PathBuf,
    },
    /// Write a starter configuration file
    Init,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List sessions, optionally filtered by title or date
    List { query: Option<String> },
    /// Print a session transcript
    Show { id: Uuid },
    /// Set a session title
    Rename { id: Uuid, title: String },
    /// Delete a session
    Delete { id: Uuid },
}

#[derive(Clone, Copy, ValueEnum)]
enum MathEngine {
    Chatgpt,
    Gemini,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "assistant_mux=debug" } else { "assistant_mux=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Get config path (use default if not specified)
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };

    let config = AppConfig::from_file(&config_path)?;
    let storage_dir = config.storage.resolve_dir()?;
    let transport = Transport::from_config(&config.gateway);
    let registry = ProviderRegistry::new(transport);
    let history = HistoryStore::in_dir(&storage_dir);

    match cli.command {
        Commands::Chat {
            provider,
            model,
            image,
            session,
        } => {
            let saved = match session {
                Some(id) => Some(
                    history
                        .get(id)
                        .await
                        .with_context(|| format!("No saved session {}", id))?,
                ),
                None => None,
            };
            let provider_id = saved
                .as_ref()
                .map(|s| s.api_model_type)
                .or(provider)
                .unwrap_or(config.defaults.provider);
            let provider = registry.get(provider_id);

            let mut controller = match saved {
                Some(saved) => ChatSessionController::resume(provider, saved, history.clone()),
                None => ChatSessionController::new(provider, history.clone()),
            }
            .with_tracer(Arc::new(MessageTracer::new(&config.tracing)));

            let quota = QuotaTracker::in_dir(&storage_dir, config.quota.daily_messages);
            if !config.quota.premium {
                controller = controller.with_quota(quota.clone());
            }

            if let Some(model) = model.as_deref().or(config.defaults.model_for(provider_id)) {
                controller.set_model_version(model);
            }
            for path in &image {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read image {}", path.display()))?;
                controller.stage_image(base64::engine::general_purpose::STANDARD.encode(bytes));
            }

            let descriptor = controller.descriptor();
            println!("💬 {} ({})", descriptor.title, controller.model_version());
            println!("   {}", descriptor.description);
            if !image.is_empty() {
                println!("   📎 {} image(s) attached to the first message", image.len());
            }
            println!("   Ctrl+C stops a response, Ctrl+D exits");
            println!();

            run_chat(&controller, &quota, config.quota.premium).await?;
            println!("📝 Session saved: {}", controller.session().id);
        }
        Commands::Providers => {
            println!("🤖 Assistants:");
            for descriptor in registry.list_providers() {
                println!();
                println!("  • {} [{}]", descriptor.title, descriptor.id);
                println!("    {}", descriptor.description);
                if descriptor.models.is_empty() {
                    println!("    Model: {}", descriptor.default_model());
                }
                for option in &descriptor.models {
                    println!("    Model: {} ({})", option.name, option.id);
                }
            }
        }
        Commands::History { action } => run_history(&history, action).await?,
        Commands::Math { file, provider } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read image {}", file.display()))?;
            let image = base64::engine::general_purpose::STANDARD.encode(bytes);
            let answer = match provider {
                MathEngine::Chatgpt => registry.openai().solve_math(&image).await?,
                MathEngine::Gemini => registry.gemini().solve_math(&image).await?,
            };
            println!("{}", answer);
        }
        Commands::Speech { text, voice, out } => {
            let audio = registry.openai().generate_speech(&text, voice).await?;
            std::fs::write(&out, &audio)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("🔊 Saved {} bytes to {}", audio.len(), out.display());
        }
        Commands::Pdf { file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read PDF {}", file.display()))?;
            println!("{}", registry.gemini().summarize_pdf(&bytes).await?);
        }
        Commands::Video { url } => {
            println!("{}", registry.gemini().summarize_video(&url).await?);
        }
        Commands::Lyrics { prompt, style } => {
            println!("{}", registry.gemini().generate_lyrics(&prompt, &style).await?);
        }
        Commands::Image {
            prompt,
            aspect_ratio,
            style,
            out,
        } => {
            let image = registry
                .stability()
                .generate_image(&prompt, &aspect_ratio, &style)
                .await?;
            std::fs::write(&out, &image)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("🎨 Saved {} bytes to {}", image.len(), out.display());
        }
        Commands::Init => {
            AppConfig::write_default(&config_path)?;
            println!("✅ Configuration written to {}", config_path.display());
        }
    }

    Ok(())
}

async fn run_chat(controller: &ChatSessionController, quota: &QuotaTracker, premium: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let text = line.trim().to_string();
        if text.is_empty() {
            continue;
        }

        if !premium && !quota.has_remaining() {
            println!("⛔ Daily limit of {} messages reached", quota.daily_limit());
            continue;
        }

        stream_reply(controller, text).await?;
    }

    Ok(())
}

/// Send one message and echo its response as it grows
async fn stream_reply(controller: &ChatSessionController, text: String) -> Result<()> {
    let index = controller.messages().len();
    let mut rx = controller.subscribe();
    let mut printed = 0;

    let mut task = tokio::spawn({
        let controller = controller.clone();
        async move { controller.send_message(text).await }
    });

    let result = loop {
        tokio::select! {
            result = &mut task => break result,
            changed = rx.changed() => {
                if changed.is_ok() {
                    print_new_text(&mut rx, index, &mut printed)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.cancel_response();
                print!(" ⏹");
            }
        }
    };
    result.context("Chat task panicked")??;

    print_new_text(&mut rx, index, &mut printed)?;
    println!();
    if let Some(error) = controller
        .messages()
        .get(index)
        .and_then(|m| m.response_error.clone())
    {
        println!("❌ {}", error);
    }
    println!();
    Ok(())
}

fn print_new_text(
    rx: &mut watch::Receiver<Vec<ChatMessage>>,
    index: usize,
    printed: &mut usize,
) -> Result<()> {
    let messages = rx.borrow_and_update();
    let Some(text) = messages.get(index).and_then(|m| m.response_text.as_deref()) else {
        return Ok(());
    };
    if text.len() > *printed {
        print!("{}", &text[*printed..]);
        std::io::stdout().flush()?;
        *printed = text.len();
    }
    Ok(())
}

async fn run_history(store: &HistoryStore, action: HistoryAction) -> Result<()> {
    match action {
        HistoryAction::List { query } => {
            let sessions = store.search(query.as_deref().unwrap_or("")).await;
            if sessions.is_empty() {
                println!("No saved sessions");
            }
            for session in sessions.iter().rev() {
                println!(
                    "{}  {:<16} {:<13} {}",
                    session.id,
                    history::display_date(session),
                    session.api_model_type,
                    session.display_title()
                );
            }
        }
        HistoryAction::Show { id } => {
            let session = store
                .get(id)
                .await
                .with_context(|| format!("No saved session {}", id))?;
            println!("📜 {} ({})", session.display_title(), history::display_date(&session));
            println!();
            for message in &session.messages {
                println!("User: {}", message.send_text);
                println!("AI: {}", message.response_or_empty());
                if let Some(ref error) = message.response_error {
                    println!("❌ {}", error);
                }
                println!();
            }
        }
        HistoryAction::Rename { id, title } => {
            if !store.rename(id, title).await {
                anyhow::bail!("No saved session {}", id);
            }
            println!("✅ Session renamed");
        }
        HistoryAction::Delete { id } => {
            if !store.delete(id).await {
                anyhow::bail!("No saved session {}", id);
            }
            println!("🗑️  Session deleted");
        }
    }
    Ok(())
}
