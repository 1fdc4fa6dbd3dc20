//! devorch - command line client for the devorch gateway

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use devorch_core::{CommandStatus, ServiceRequest, SubmissionStatus};
use devorch_gateway::{GatewayClient, RunCommand, DEFAULT_HOST, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod api;
mod render;

use api::ApiClient;

/// devorch - guarded command execution and dev services
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway address (host:port); defaults to $DEVORCH_GATEWAY
    #[arg(short, long, global = true)]
    gateway: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a command (or plain language with --nlp)
    Run {
        /// Command text
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,

        /// Working directory (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Translate plain language into a command first
        #[arg(long)]
        nlp: bool,

        /// NLP provider to ask first
        #[arg(long)]
        provider: Option<String>,

        /// Wait for the command to finish and print its output
        #[arg(short, long)]
        wait: bool,
    },

    /// Approve a pending command
    Approve { id: String },

    /// Reject a pending command
    Reject { id: String },

    /// Cancel a pending or running command
    Cancel { id: String },

    /// List managed services
    Services,

    /// Start a managed service
    Start {
        name: String,
        command: String,

        #[arg(long)]
        cwd: Option<PathBuf>,

        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop a managed service
    Stop { id: String },

    /// Show the current state
    Status {
        /// Output in JSON format for integrations
        #[arg(long)]
        json: bool,
    },

    /// Follow live events
    Tail {
        /// Print raw frames
        #[arg(long)]
        json: bool,
    },

    /// Manage saved commands
    Saved {
        #[command(subcommand)]
        action: SavedAction,
    },
}

#[derive(Subcommand)]
enum SavedAction {
    /// List saved commands
    List,
    /// Save a command under a name
    Add {
        name: String,
        command: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Delete a saved command
    Rm { id: String },
    /// Run a saved command
    Run { id: String },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn gateway_address(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("DEVORCH_GATEWAY").ok())
        .unwrap_or_else(|| format!("{}:{}", DEFAULT_HOST, DEFAULT_PORT))
}

fn working_directory(cwd: Option<PathBuf>) -> Result<PathBuf> {
    let cwd = match cwd {
        Some(path) if path.is_absolute() => path,
        Some(path) => std::env::current_dir()?.join(path),
        None => std::env::current_dir()?,
    };
    Ok(cwd.canonicalize().unwrap_or(cwd))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let api = ApiClient::new(&gateway_address(cli.gateway));
    tracing::debug!("Using gateway at {}", api.base());

    match cli.command {
        Commands::Run {
            text,
            cwd,
            nlp,
            provider,
            wait,
        } => {
            let mut run = RunCommand::new(text.join(" "));
            run.cwd = Some(working_directory(cwd)?);
            run.use_nlp = nlp;
            run.provider = provider;
            let submission = api.run(&run).await?;
            println!("{}", render::submission(&submission));
            if wait
                && submission.status == SubmissionStatus::Executed
                && submission.command.is_some()
            {
                wait_for(&api, &submission.id).await?;
            }
        }
        Commands::Approve { id } => {
            api.approve(&id).await?;
            println!("{} {}", "approved".green(), id);
        }
        Commands::Reject { id } => {
            api.reject(&id).await?;
            println!("{} {}", "rejected".red(), id);
        }
        Commands::Cancel { id } => {
            api.cancel(&id).await?;
            println!("{} {}", "cancelled".yellow(), id);
        }
        Commands::Services => {
            println!("{}", render::services(&api.services().await?));
        }
        Commands::Start {
            name,
            command,
            cwd,
            port,
        } => {
            let mut request = ServiceRequest::new(name, command).with_cwd(working_directory(cwd)?);
            request.port = port;
            let service = api.start_service(&request).await?;
            println!("{}", render::services(&[service]));
        }
        Commands::Stop { id } => {
            let service = api.stop_service(&id).await?;
            println!("{} {}", "stopped".dimmed(), service.name);
        }
        Commands::Status { json } => {
            let snapshot = api.state().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", render::status(&snapshot));
            }
        }
        Commands::Tail { json } => tail(&api, json).await?,
        Commands::Saved { action } => saved(&api, action).await?,
    }

    Ok(())
}

async fn wait_for(api: &ApiClient, id: &str) -> Result<()> {
    loop {
        let record = api.command(id).await?;
        if record.is_finished() {
            println!("{}", render::command_record(&record));
            if record.status != CommandStatus::Completed {
                std::process::exit(record.exit_code.unwrap_or(1));
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn tail(api: &ApiClient, json: bool) -> Result<()> {
    let url = api.ws_url();
    let mut conn = GatewayClient::new(url.as_str())
        .connect()
        .await
        .with_context(|| format!("cannot follow {}", url))?;

    loop {
        tokio::select! {
            frame = conn.recv() => {
                let Some(frame) = frame? else {
                    eprintln!("{}", "gateway closed the connection".dimmed());
                    return Ok(());
                };
                if json {
                    println!("{}", serde_json::to_string(&frame)?);
                } else if let Some(line) = render::frame(&frame) {
                    println!("{}", line);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = conn.close().await;
                return Ok(());
            }
        }
    }
}

async fn saved(api: &ApiClient, action: SavedAction) -> Result<()> {
    match action {
        SavedAction::List => {
            let saved = api.saved().await?;
            if saved.is_empty() {
                println!("{}", "no saved commands".dimmed());
            }
            for entry in saved {
                let tags = if entry.tags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", entry.tags.join(", "))
                };
                println!(
                    "{} {} {}{}",
                    entry.id.as_str().dimmed(),
                    entry.name.as_str().bold(),
                    entry.command,
                    tags
                );
            }
        }
        SavedAction::Add {
            name,
            command,
            cwd,
            description,
            tags,
        } => {
            let body = serde_json::json!({
                "name": name,
                "command": command,
                "working_directory": cwd.map(|c| working_directory(Some(c))).transpose()?,
                "description": description,
                "tags": tags,
            });
            let saved = api.save(&body).await?;
            println!("{} {} ({})", "saved".green(), saved.name, saved.id);
        }
        SavedAction::Rm { id } => {
            api.delete_saved(&id).await?;
            println!("{} {}", "deleted".dimmed(), id);
        }
        SavedAction::Run { id } => {
            let submission = api.run_saved(&id).await?;
            println!("{}", render::submission(&submission));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_joins_words() {
        let cli = Cli::parse_from(["devorch", "run", "--nlp", "list", "files", "here"]);
        match cli.command {
            Commands::Run { text, nlp, .. } => {
                assert!(nlp);
                assert_eq!(text.join(" "), "list files here");
            }
            _ => panic!("expected run"),
        }

        let cli = Cli::parse_from(["devorch", "run", "ls", "-la"]);
        match cli.command {
            Commands::Run { text, nlp, .. } => {
                assert!(!nlp);
                assert_eq!(text, vec!["ls".to_string(), "-la".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_gateway_flag_wins() {
        assert_eq!(gateway_address(Some("10.0.0.2:9000".to_string())), "10.0.0.2:9000");
    }

    #[test]
    fn test_relative_cwd_is_made_absolute() {
        let cwd = working_directory(Some(PathBuf::from("."))).unwrap();
        assert!(cwd.is_absolute());
    }
}
