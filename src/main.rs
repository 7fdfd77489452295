//! airlock: offline chat with local GGUF models.
//!
//! Subcommands:
//!   models    scan the model directory and print the catalog
//!   generate  answer one message, optionally with attached files
//!   bridge    serve JSON-lines requests on stdin/stdout for a host UI
//!
//! Logs go to stderr so stdout carries only results.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{error, info};

use airlock::bridge;
use airlock::config::{Cli, Command, Config, LogFormat};
use airlock::engine::default_runtime;
use airlock::types::{Attachment, ChatTurn, InferenceRequest};
use airlock::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("airlock v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        models_dir = %config.catalog.models_dir.display(),
        context_size = config.engine.context_size,
        max_tokens = config.generation.max_tokens,
        timeout_secs = config.generation.timeout_secs,
        history = ?config.prompt.history,
        admission = ?config.scheduler.admission,
        "Configuration loaded"
    );

    let runtime = default_runtime().context("native runtime unavailable")?;
    let orchestrator = Arc::new(Orchestrator::new(config, runtime)?);

    let outcome = run(&cli.command, &orchestrator).await;

    // Release the model on every exit path.
    if let Err(e) = orchestrator.shutdown().await {
        error!("Shutdown failed: {e}");
    }

    outcome
}

fn init_tracing(cli: &Cli) {
    let filter = if cli.verbose {
        "airlock=debug"
    } else {
        "airlock=info"
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true);

    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(command: &Command, orchestrator: &Arc<Orchestrator>) -> anyhow::Result<()> {
    match command {
        Command::Models => {
            let models = orchestrator.list_models().await?;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }

        Command::Generate {
            model,
            prompt,
            transcript,
            attachments,
            system,
        } => {
            let descriptor = orchestrator.catalog().resolve(model)?.ok_or_else(|| {
                anyhow!(
                    "no model matching {model:?} in {}",
                    orchestrator.catalog().dir().display()
                )
            })?;

            let mut turns: Vec<ChatTurn> = match transcript {
                Some(path) => {
                    let raw = std::fs::read_to_string(path)
                        .with_context(|| format!("reading transcript {}", path.display()))?;
                    serde_json::from_str(&raw)
                        .with_context(|| format!("parsing transcript {}", path.display()))?
                }
                None => Vec::new(),
            };
            turns.push(ChatTurn::user(prompt.clone()));

            let files = attachments
                .iter()
                .map(|path| read_attachment(path))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut request = InferenceRequest::new(descriptor.id, turns).with_attachments(files);
            request.system_instruction = system.clone();

            let generation = orchestrator.generate(request).await?;
            println!("{}", generation.text);
        }

        Command::Bridge => {
            info!("Bridge ready on stdin/stdout");
            tokio::select! {
                result = bridge::serve(orchestrator.clone(), tokio::io::stdin(), tokio::io::stdout()) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
            }
        }
    }

    Ok(())
}

/// Read a file for attachment. Invalid UTF-8 is replaced rather than rejected.
fn read_attachment(path: &Path) -> anyhow::Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("reading attachment {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let mut attachment = Attachment::new(name, String::from_utf8_lossy(&bytes));
    attachment.size = bytes.len() as u64;
    Ok(attachment)
}
