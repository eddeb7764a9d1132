//! Chat Stream Client - Terminal front end
//!
//! Interactive chat session over the streaming WebSocket protocol, plus
//! conversation listing and file uploads over REST.

use anyhow::{Context, Result};
use chat_stream_client::api::ApiClient;
use chat_stream_client::chat::{SessionEngine, SessionHandle};
use chat_stream_client::connection::ConnectionStatus;
use chat_stream_client::events::SessionEvent;
use chat_stream_client::stream::NotificationPhase;
use chat_stream_client::Config;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chat-client")]
#[command(about = "Streaming chat session client")]
struct Cli {
    /// Path to the YAML config file (defaults to ./config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open an interactive chat session
    Connect {
        /// Resume an existing conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Project scope (overrides config)
        #[arg(long)]
        project: Option<String>,

        /// Message sent as soon as the connection opens
        #[arg(long)]
        prefill: Option<String>,
    },

    /// List conversations
    Conversations {
        /// Only conversations of this project
        #[arg(long)]
        project: Option<String>,
    },

    /// Upload a file
    Upload {
        /// File to upload
        file: PathBuf,

        /// Attach the file to this conversation
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing; stdout carries the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chat_stream_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Connect {
            conversation,
            project,
            prefill,
        } => run_connect(config, conversation, project, prefill).await,
        Commands::Conversations { project } => run_conversations(config, project).await,
        Commands::Upload { file, conversation } => {
            run_upload(config, file, conversation.as_deref()).await
        }
    }
}

async fn run_connect(
    config: Config,
    conversation: Option<String>,
    project: Option<String>,
    prefill: Option<String>,
) -> Result<()> {
    let session = config.session(conversation, project);
    let (mut engine, handle) = SessionEngine::new(
        config.engine_config(),
        session,
        Arc::new(config.connector()),
        config.draft_store(),
    );
    if let Some(text) = prefill {
        engine = engine.with_prefill(text);
    }

    let printer = tokio::spawn(print_events(handle.subscribe()));
    let engine_task = engine.spawn();

    eprintln!("Commands: /stop /sync /new /reconnect /discard /quit");
    read_input(&handle).await?;

    handle.shutdown()?;
    engine_task.await.context("session engine panicked")?;
    printer.abort();
    Ok(())
}

/// Forward stdin lines to the engine until EOF or /quit
async fn read_input(handle: &SessionHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "/quit" => break,
            "/stop" => handle.stop_generation()?,
            "/sync" => handle.request_sync()?,
            "/new" => handle.new_chat()?,
            "/reconnect" => handle.reconnect()?,
            "/discard" => handle.dismiss_draft()?,
            "" => {}
            _ => handle.send_message(line)?,
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::ContentDelta { text } => {
            let mut stdout = std::io::stdout();
            let _ = write!(stdout, "{}", text);
            let _ = stdout.flush();
        }
        SessionEvent::ResponseCompleted { .. } => println!(),
        SessionEvent::Notification {
            notification_type,
            phase,
            content,
        } => match phase {
            NotificationPhase::Early => eprintln!("[{}…]", notification_type),
            NotificationPhase::Complete => eprintln!("[{}] {}", notification_type, content),
        },
        SessionEvent::ConnectionStatusChanged { status } => match status {
            ConnectionStatus::Connecting { attempt } => eprintln!("[connecting, attempt {}]", attempt),
            ConnectionStatus::Connected => eprintln!("[connected]"),
            ConnectionStatus::Reconnecting { attempt, delay_ms } => {
                eprintln!("[reconnecting in {}ms, attempt {}]", delay_ms, attempt)
            }
            ConnectionStatus::Disconnected => eprintln!("[disconnected]"),
            ConnectionStatus::Failed { attempts } => eprintln!(
                "[connection failed after {} attempts, /reconnect to retry]",
                attempts
            ),
        },
        SessionEvent::HistoryLoaded { messages } => {
            eprintln!("[history: {} messages]", messages.len())
        }
        SessionEvent::MessageReceived { message } => {
            if let Some(content) = &message.content {
                println!("{}", content);
            }
        }
        SessionEvent::ServerError { message, code } => match code {
            Some(code) => eprintln!("[error {}] {}", code, message),
            None => eprintln!("[error] {}", message),
        },
        SessionEvent::ConversationAssigned { conversation_id } => {
            eprintln!("[conversation {}]", conversation_id)
        }
        SessionEvent::DraftRestored { text } => {
            eprintln!("[draft restored, /discard to drop] {}", text)
        }
        SessionEvent::ActionRejected { action, reason } => {
            eprintln!("[{} rejected: {}]", action, reason)
        }
        SessionEvent::GenerationStateChanged { .. }
        | SessionEvent::ToolProgress { .. }
        | SessionEvent::UsageUpdated { .. }
        | SessionEvent::ConversationListInvalidated => {
            tracing::debug!(kind = event.kind(), "Session event");
        }
    }
}

async fn run_conversations(config: Config, project: Option<String>) -> Result<()> {
    let client = ApiClient::new(&config.api_url)?;
    let project = project.or(config.project_id);
    let conversations = client.list_conversations(project.as_deref()).await?;

    if conversations.is_empty() {
        println!("No conversations");
        return Ok(());
    }
    for conversation in conversations {
        println!(
            "{}  {}  {}",
            conversation.id,
            conversation.updated_at.as_deref().unwrap_or("-"),
            conversation.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

async fn run_upload(config: Config, file: PathBuf, conversation: Option<&str>) -> Result<()> {
    let client = ApiClient::new(&config.api_url)?;
    let uploaded = client
        .upload_file(&file, conversation)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;

    tracing::info!(
        file_id = ?uploaded.id,
        filename = ?uploaded.filename,
        "Upload complete"
    );
    println!("{}", uploaded.id.as_deref().unwrap_or("uploaded"));
    Ok(())
}
