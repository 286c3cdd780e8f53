use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mpa_bot::{openai_chat_model, Dialogue, Reply, UserEvent, MENU_ASK, MENU_RECOMMEND};
use mpa_ingest::{IngestConfig, IngestPipeline, PdfPlanExtractor, SlugOutcome};
use mpa_storage::{HttpClientConfig, HttpFetcher, ProgramStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpa-cli")]
#[command(about = "Master's Program Advisor command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest the configured program set once and print per-slug outcomes.
    Ingest,
    /// Talk to the advisor on stdin/stdout.
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => ingest().await,
        Commands::Chat => chat().await,
    }
}

async fn ingest() -> Result<()> {
    let config = IngestConfig::from_env();
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = ProgramStore::connect(&config.database_url).await?;
    store.ensure_schema().await?;

    let slugs = config.program_slugs.clone();
    let pipeline = IngestPipeline::new(
        config,
        Arc::new(fetcher),
        Arc::new(store),
        Arc::new(PdfPlanExtractor),
    );
    let report = pipeline.run(&slugs).await;

    for outcome in &report.outcomes {
        match outcome {
            SlugOutcome::Success { slug, title } => println!("processed: {title} ({slug})"),
            SlugOutcome::Failure { slug, error } => println!("error {slug}: {error}"),
        }
    }
    println!(
        "ingest complete: run_id={} ok={} failed={}",
        report.run_id,
        report.succeeded(),
        report.failed()
    );
    Ok(())
}

async fn chat() -> Result<()> {
    let config = IngestConfig::from_env();
    let model_name = std::env::var("MPA_MODEL").unwrap_or_else(|_| "gpt-4".to_string());
    let model = openai_chat_model(&model_name)?;
    let store = ProgramStore::connect(&config.database_url).await?;
    let dialogue = Dialogue::new(
        Arc::new(store),
        Arc::new(model),
        config.program_slugs.clone(),
    );

    let session = "terminal";
    println!("(/start restarts, /cancel cancels, /quit exits)");
    render(&dialogue.handle(session, UserEvent::Start).await);

    for line in io::stdin().lock().lines() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }
        let event = match text {
            "/start" => UserEvent::Start,
            "/cancel" => UserEvent::Cancel,
            "1" => UserEvent::ChooseRecommendation,
            "2" => UserEvent::ChooseQuestion,
            _ if text == MENU_RECOMMEND => UserEvent::ChooseRecommendation,
            _ if text == MENU_ASK => UserEvent::ChooseQuestion,
            _ => UserEvent::Message(text.to_string()),
        };
        render(&dialogue.handle(session, event).await);
    }
    Ok(())
}

fn render(replies: &[Reply]) {
    for reply in replies {
        match reply {
            Reply::Text(text) => println!("{text}"),
            Reply::Menu { text, options } => {
                println!("{text}");
                for (idx, option) in options.iter().enumerate() {
                    println!("  {}. {option}", idx + 1);
                }
            }
        }
    }
}
