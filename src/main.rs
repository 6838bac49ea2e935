//! mcp-probe - drive an MCP tool server from the command line

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;

use mcp_stdio_client::config::{self, ToolServerConfig};
use mcp_stdio_client::prompt::render_tool_prompt;
use mcp_stdio_client::{Framing, ToolServer};

/// Talk to an MCP tool server over stdio
#[derive(Parser, Debug)]
#[command(name = "mcp-probe", author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $MCP_STDIO_CONFIG or the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the server command
    #[arg(long, global = true)]
    server_command: Option<String>,

    /// Extra argument for the server command (repeatable)
    #[arg(long = "server-arg", global = true, allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Extra environment variable for the server, KEY=VALUE (repeatable)
    #[arg(long = "env", global = true, value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Stderr substring that marks the server as ready
    #[arg(long, global = true)]
    ready_marker: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Use Content-Length framing instead of newline-delimited JSON
    #[arg(long, global = true)]
    content_length: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the tools the server advertises
    Tools,

    /// Call a tool
    Call {
        /// Tool name
        name: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Restart the server and retry once if the channel closes
        #[arg(long)]
        retry: bool,
    },

    /// Send an arbitrary JSON-RPC request
    Raw {
        method: String,

        /// Params as JSON
        #[arg(short, long, default_value = "{}")]
        params: String,
    },

    /// Print the tool-selection prompt for the server's tools
    Prompt {
        /// The user's request
        #[arg(short, long)]
        request: String,

        /// System instructions to include
        #[arg(short, long)]
        instructions: Option<String>,
    },
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_json(label: &str, raw: &str) -> Result<JsonValue> {
    serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON: {}", label, raw))
}

fn load_config(cli: &Cli) -> Result<ToolServerConfig> {
    let mut config = match &cli.config {
        Some(path) => config::read_config_from_path(path)?,
        None => config::read_config()?,
    };

    if let Some(command) = &cli.server_command {
        config.command = command.clone();
        config.args = cli.server_args.clone();
    } else {
        config.args.extend(cli.server_args.iter().cloned());
    }
    config.env.extend(cli.env.iter().cloned());
    if let Some(marker) = &cli.ready_marker {
        config.ready_marker = Some(marker.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    if cli.content_length {
        config.framing = Framing::ContentLength;
    }

    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, server: &ToolServer) -> Result<()> {
    match cli.command {
        Commands::Tools => {
            let tools = server.client().await?.list_tools().await?;
            if tools.is_empty() {
                println!("No tools registered");
            }
            for tool in tools {
                let required = tool.input_schema.required.join(", ");
                println!("{}: {}", tool.name, tool.description);
                if !required.is_empty() {
                    println!("    required: {}", required);
                }
            }
        }
        Commands::Call { name, args, retry } => {
            let arguments = parse_json("--args", &args)?;
            if !arguments.is_object() {
                return Err(anyhow!("--args must be a JSON object"));
            }

            let client = server.client().await?;
            let result = match client.call_tool(&name, arguments.clone()).await {
                Err(e) if retry && e.is_channel_closed() => {
                    tracing::warn!("{}; restarting tool server and retrying", e);
                    server.restart().await?.call_tool(&name, arguments).await?
                }
                other => other?,
            };

            if result.is_error {
                eprintln!("Tool reported an error");
            }
            let text = result.text();
            if text.is_empty() {
                print_json(&result)?;
            } else {
                println!("{}", text);
            }
        }
        Commands::Raw { method, params } => {
            let params = parse_json("--params", &params)?;
            let result = server.client().await?.call(&method, params).await?;
            print_json(&result)?;
        }
        Commands::Prompt {
            request,
            instructions,
        } => {
            let tools = server.client().await?.list_tools().await?;
            println!(
                "{}",
                render_tool_prompt(instructions.as_deref(), &tools, &request)
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "mcp_stdio_client=debug,mcp_probe=debug"
    } else {
        "mcp_stdio_client=info,mcp_probe=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .init();

    let config = load_config(&cli)?;
    tracing::debug!(
        "Using tool server '{}' ({} {:?}), request timeout {:?}",
        config.name,
        config.command,
        config.args,
        Duration::from_millis(config.request_timeout_ms)
    );

    let server = ToolServer::new(config);
    let outcome = run(cli, &server).await;

    if let Err(e) = server.stop().await {
        tracing::warn!("Failed to stop tool server: {}", e);
    }
    outcome
}
