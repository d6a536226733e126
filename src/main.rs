//! `mcp-tester`: command-line driver for MCP servers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

use mcp_tester::mcp_client::config::{self, ServersConfig};
use mcp_tester::mcp_client::{inspect, SessionManager};
use mcp_tester::LogTarget;

#[derive(Debug, Parser)]
#[command(name = "mcp-tester", version, about = "Launch, drive, and observe MCP servers")]
struct Cli {
    /// Server catalogue: a YAML/JSON file or a directory of per-server JSON files.
    #[arg(short, long, env = "MCP_TESTER_CONFIG")]
    config: Option<PathBuf>,

    /// Write process logs to the rotated log file instead of stderr.
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured servers.
    List,
    /// Connect to a server and print its status and facets.
    Inspect { server: String },
    /// Call a tool and print the raw response envelope.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
        /// Request `_meta` as a JSON object.
        #[arg(long)]
        meta: Option<String>,
    },
    /// Read a resource.
    Read { server: String, uri: String },
    /// Render a prompt.
    Prompt {
        server: String,
        name: String,
        /// Prompt arguments as a JSON object.
        #[arg(long)]
        args: Option<String>,
    },
    /// Connect and follow the server's log tail until interrupted.
    Logs { server: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mcp_tester::init_tracing(if cli.log_file {
        LogTarget::File
    } else {
        LogTarget::Stderr
    });

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let servers = config::load_servers(&path)
        .with_context(|| format!("loading server catalogue from {}", path.display()))?;

    if let Command::List = cli.command {
        print_catalogue(&servers);
        return Ok(());
    }

    let manager = SessionManager::new(Arc::new(servers));
    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &SessionManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => Ok(()),
        Command::Inspect { server } => {
            let status = inspect::connect(manager, &server).await?;
            print_json(&serde_json::to_value(&status)?)?;
            let session = inspect::require_session(manager, &server)?;
            let facets = inspect::cached_facets(&session);
            print_json(&serde_json::to_value(&facets)?)
        }
        Command::Call {
            server,
            tool,
            args,
            meta,
        } => {
            inspect::connect(manager, &server).await?;
            let meta = meta
                .as_deref()
                .map(|m| inspect::parse_json_input(Some(m)))
                .transpose()?;
            let response =
                inspect::invoke_tool(manager, &server, &tool, args.as_deref(), meta).await?;
            print_json(&response)
        }
        Command::Read { server, uri } => {
            inspect::connect(manager, &server).await?;
            print_json(&inspect::read_resource(manager, &server, &uri).await?)
        }
        Command::Prompt { server, name, args } => {
            inspect::connect(manager, &server).await?;
            print_json(&inspect::get_prompt(manager, &server, &name, args.as_deref()).await?)
        }
        Command::Logs { server } => follow_logs(manager, &server).await,
    }
}

async fn follow_logs(manager: &SessionManager, server: &str) -> anyhow::Result<()> {
    let mut logs = manager.log_stream_for(server).subscribe();
    if let Err(e) = inspect::connect(manager, server).await {
        tracing::warn!(server = %server, error = %e, "connect failed");
    }

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            entry = logs.recv() => match entry {
                Some(entry) => println!("{entry}"),
                None => break,
            },
            _ = &mut interrupted => break,
        }
    }
    Ok(())
}

fn print_catalogue(servers: &ServersConfig) {
    for server in &servers.servers {
        let transport = server.transport.as_deref().unwrap_or("stdio");
        let target = match &server.http_url {
            Some(url) if !transport.eq_ignore_ascii_case("stdio") => url.as_str(),
            _ => server.command.as_deref().unwrap_or(""),
        };
        println!("{:<24} {:<10} {}", server.id, transport, target);
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
