use clap::Parser;
use colloquy_ai::OpenAiClient;
use colloquy_cli::{config::CliConfig, db::PgHistoryStore, load_image, render::render, tools::builtin_tools};
use colloquy_conversation::{HistoryStore, InMemoryHistoryStore, LoginContext};
use colloquy_core::{ConversationId, UserId};
use colloquy_engine::{ChannelEmitter, Orchestrator, TurnError, TurnOutcome, TurnRequest};
use futures::StreamExt;
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Chat with a tool-calling model from the terminal.
#[derive(Debug, Parser)]
#[command(name = "colloquy", version)]
struct Args {
    /// Conversation to continue. A new one is started when omitted.
    #[arg(long)]
    conversation: Option<String>,

    /// User the conversation belongs to.
    #[arg(long, default_value = "local")]
    user: String,

    /// Image to attach to the first message.
    #[arg(long)]
    image: Option<PathBuf>,

    /// Session cookie answered by the login lookup tool.
    #[arg(long)]
    cookie: Option<String>,

    /// Wait for the whole reply instead of streaming it.
    #[arg(long)]
    blocking: bool,

    /// Message to send. Lines are read from stdin when omitted.
    message: Option<String>,
}

#[tokio::main]
async fn main() {
    // stdout carries only the model's reply.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,colloquy=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = CliConfig::from_env().expect("failed to load configuration");
    tracing::debug!(endpoint = %config.provider.base_url, "Loaded configuration");

    let history: Arc<dyn HistoryStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .expect("failed to connect to database");

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("failed to run migrations");
            Arc::new(PgHistoryStore::new(pool))
        }
        None => {
            tracing::info!("DATABASE_URL not set, keeping history in memory");
            Arc::new(InMemoryHistoryStore::new())
        }
    };

    let completion = OpenAiClient::new(&config.provider).expect("failed to build completion client");
    let orchestrator = Orchestrator::new(
        config.engine,
        Arc::new(completion),
        history,
        Arc::new(builtin_tools()),
    );

    let mut image = match &args.image {
        Some(path) => load_image(path).await.expect("failed to read image"),
        None => None,
    };

    let conversation_id = args
        .conversation
        .clone()
        .map(ConversationId::new)
        .unwrap_or_else(ConversationId::generate);
    let user_id = UserId::new(args.user.clone());
    eprintln!("conversation: {conversation_id}");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let new_request = |text: String, image: Option<Vec<u8>>| {
        let mut request = TurnRequest::new(conversation_id.clone(), user_id.clone(), text)
            .with_cancellation(cancel.clone());
        if let Some(image) = image {
            request = request.with_image(image);
        }
        if let Some(cookie) = &args.cookie {
            request = request.with_login(LoginContext::new(user_id.clone(), cookie.clone()));
        }
        request
    };

    if let Some(message) = args.message.clone() {
        let request = new_request(message, image.take());
        if let Err(e) = run_turn(&orchestrator, request, args.blocking).await {
            tracing::error!(error = %e, "turn failed");
            std::process::exit(1);
        }
        return;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = new_request(line, image.take());
        if let Err(e) = run_turn(&orchestrator, request, args.blocking).await {
            tracing::error!(error = %e, "turn failed");
            if cancel.is_cancelled() {
                break;
            }
        }
    }
}

async fn run_turn(
    orchestrator: &Orchestrator,
    request: TurnRequest,
    blocking: bool,
) -> colloquy_core::Result<(), TurnError> {
    if blocking {
        let reply = orchestrator.chat(request).await?;
        println!("{}", reply.text);
        if reply.outcome != TurnOutcome::Completed {
            eprintln!("[stopped: {:?}]", reply.outcome);
        }
        return Ok(());
    }

    let (emitter, mut events) = ChannelEmitter::new();
    let printer = tokio::spawn(async move {
        let mut out = std::io::stdout();
        let mut err = std::io::stderr();
        while let Some(event) = events.next().await {
            if let Err(e) = render(&event, &mut out, &mut err) {
                tracing::warn!(error = %e, "failed to write output");
            }
        }
    });

    let outcome = orchestrator.chat_stream(request, &emitter).await;
    drop(emitter);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "output task failed");
    }
    outcome.map(|_| ())
}
