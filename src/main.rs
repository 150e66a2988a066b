//! Toolwarden command-line front end
//!
//! Runs single verifications, lists signatures, and serves the engine to an
//! intercepting proxy over line-delimited JSON on stdio.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

mod commands;

#[derive(Parser)]
#[command(name = "toolwarden")]
#[command(about = "Security verification for MCP tool calls and tool responses")]
#[command(version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Signature definitions (JSON); defaults to <signatures_dir>/signatures.json
    #[arg(short, long, global = true)]
    signatures: Option<PathBuf>,

    /// Registered/protected server tool indexes (JSON)
    #[arg(short, long, global = true)]
    tools: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one tool call or tool response and print the decision
    Check {
        /// Tool name
        #[arg(long)]
        tool: String,
        /// Call arguments or response payload as JSON
        #[arg(long, default_value = "{}")]
        args: String,
        /// Treat the payload as a tool response
        #[arg(long)]
        response: bool,
        /// Rationale supplied by the invoking agent
        #[arg(long)]
        intent: Option<String>,
        /// MCP client application name
        #[arg(long)]
        app: Option<String>,
        /// MCP server name
        #[arg(long)]
        server: Option<String>,
        /// MCP server version
        #[arg(long)]
        server_version: Option<String>,
        /// Append scan events as JSON lines to this file
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Serve verification requests over stdio
    Serve {
        /// Append scan events as JSON lines to this file as well
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// List signatures and whether they are enabled
    Signatures {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries results and the serve protocol
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let sources = commands::Sources {
        config: cli.config,
        signatures: cli.signatures,
        tools: cli.tools,
    };

    match cli.command {
        Commands::Check {
            tool,
            args,
            response,
            intent,
            app,
            server,
            server_version,
            events,
        } => {
            let request = commands::check::CheckRequest {
                tool,
                args,
                response,
                intent,
                app,
                server,
                server_version,
                events,
            };
            let allowed = commands::check::run(&sources, request).await?;
            if !allowed {
                std::process::exit(2);
            }
            Ok(())
        }
        Commands::Serve { events } => commands::serve::run(&sources, events).await,
        Commands::Signatures { json } => commands::signatures::run(&sources, json),
    }
}
