use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::orchestrator::Orchestrator;
use crate::request::{Message, RequestConfig, ResponseFormat};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Policy-driven gateway for heterogeneous LLM providers", version)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the CLI proxy server (chat completions + polling endpoints)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send a one-shot request and print the response content
    Ask {
        /// Model name, e.g. gpt-4o, cli/opus, runpod/{pod}/{model}
        #[arg(short, long)]
        model: String,
        /// The prompt to send
        prompt: String,
        /// Request JSON output (installs the JSON validators)
        #[arg(long)]
        json: bool,
        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = GatewayConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.proxy.host = host;
            }
            if let Some(port) = port {
                config.proxy.port = port;
            }
            if which::which(&config.proxy.cli_path).is_err()
                && !config.proxy.cli_path.is_file()
            {
                warn!(
                    "CLI binary '{}' not found on PATH; requests will fail until it exists",
                    config.proxy.cli_path.display()
                );
            }
            info!(
                "starting proxy on {}:{} (workspace {})",
                config.proxy.host,
                config.proxy.port,
                config.proxy.workspace_dir.display()
            );
            crate::proxy::serve(config).await
        }
        Commands::Ask {
            model,
            prompt,
            json,
            system,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));

            let mut request = RequestConfig::new(model, messages);
            if json {
                request.response_format = Some(ResponseFormat::json_object());
            }

            let orchestrator = Orchestrator::new(config);
            let response = orchestrator
                .make_request(request)
                .await
                .context("request failed")?;
            println!("{}", response.content());
            Ok(())
        }
    }
}
