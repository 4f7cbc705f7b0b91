//! courier — run an A2A agent or talk to registered peers

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_a2a::{A2aClient, A2aServer, ListTasksQuery, SendMessageRequest};
use courier_store::{AgentRegistry, Message, RegisterAgent, TaskPriority, TaskState, TaskStore};
use tracing::{info, warn};

use crate::config::CourierConfig;

#[derive(Parser)]
#[command(name = "courier", version, about = "Agent-to-agent task exchange")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding registry.db and tasks.db
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run this agent's A2A server until interrupted
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// List agents in the registry
    Agents {
        /// Include inactive and stale agents
        #[arg(long)]
        all: bool,
    },
    /// Add or update a peer in the registry
    Register {
        agent_id: String,
        base_url: String,
        port: u16,
    },
    /// Send a text message to a peer, creating a task unless --task is given
    Send {
        agent_id: String,
        text: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        priority: Option<TaskPriority>,
    },
    /// Show a task on a peer
    Task { agent_id: String, task_id: String },
    /// List tasks on a peer
    Tasks {
        agent_id: String,
        #[arg(long)]
        status: Option<TaskState>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Cancel a task on a peer
    Cancel { agent_id: String, task_id: String },
    /// Fetch the result of a finished task
    Result { agent_id: String, task_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = CourierConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.server.data_dir = Some(dir);
    }

    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let registry = Arc::new(
        AgentRegistry::open(data_dir.join("registry.db")).context("Failed to open agent registry")?,
    );

    let outcome = run(cli.command, &config, &registry, &data_dir).await;
    if let Err(e) = registry.close().await {
        warn!("Failed to close agent registry: {}", e);
    }
    outcome
}

async fn run(
    command: Command,
    config: &CourierConfig,
    registry: &Arc<AgentRegistry>,
    data_dir: &Path,
) -> Result<()> {
    match command {
        Command::Serve { host, port } => serve(config, registry, data_dir, host, port).await,
        Command::Agents { all } => list_agents(registry, all).await,
        Command::Register {
            agent_id,
            base_url,
            port,
        } => {
            let entry = registry
                .register(RegisterAgent::new(agent_id, base_url, port))
                .await
                .context("Failed to register agent")?;
            println!("Registered {} at {}:{}", entry.agent_id, entry.base_url, entry.port);
            Ok(())
        }
        Command::Send {
            agent_id,
            text,
            task,
            name,
            priority,
        } => {
            let mut request = SendMessageRequest::new(Message::user_text(text));
            if let Some(task) = task {
                request = request.for_task(task);
            }
            if let Some(name) = name {
                request = request.named(name);
            }
            if let Some(priority) = priority {
                request = request.with_priority(priority);
            }
            let response = client(config, registry)?
                .send_message(&agent_id, &request)
                .await?;
            print_json(&response)
        }
        Command::Task { agent_id, task_id } => {
            print_json(&client(config, registry)?.get_task(&agent_id, &task_id).await?)
        }
        Command::Tasks {
            agent_id,
            status,
            limit,
        } => {
            let mut query = ListTasksQuery::default().page(limit, 0);
            if let Some(status) = status {
                query = query.with_status(status);
            }
            print_json(&client(config, registry)?.list_tasks(&agent_id, &query).await?)
        }
        Command::Cancel { agent_id, task_id } => {
            print_json(&client(config, registry)?.cancel_task(&agent_id, &task_id).await?)
        }
        Command::Result { agent_id, task_id } => print_json(
            &client(config, registry)?
                .get_task_result(&agent_id, &task_id)
                .await?,
        ),
    }
}

fn client(config: &CourierConfig, registry: &Arc<AgentRegistry>) -> Result<A2aClient> {
    A2aClient::new(Arc::clone(registry), config.client_config())
        .context("Failed to build A2A client")
}

async fn serve(
    config: &CourierConfig,
    registry: &Arc<AgentRegistry>,
    data_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let mut server_config = config.server_config();
    if let Some(host) = host {
        server_config.host = host;
    }
    if port.is_some() {
        server_config.port = port;
    }

    let store = TaskStore::open(data_dir.join("tasks.db")).context("Failed to open task store")?;
    let server = A2aServer::new(server_config, Arc::clone(registry), store);
    let addr = server.start().await.context("Failed to start A2A server")?;
    info!("Agent '{}' ready on {} (Ctrl-C to stop)", server.agent_id(), addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    server.stop().await;
    Ok(())
}

async fn list_agents(registry: &AgentRegistry, all: bool) -> Result<()> {
    let agents = if all {
        registry.list_all().await?
    } else {
        registry.list_active().await?
    };
    if agents.is_empty() {
        println!("No agents registered");
        return Ok(());
    }
    for agent in agents {
        println!(
            "{:<24} {:<8} {}:{}  last heartbeat {}",
            agent.agent_id,
            agent.status.as_str(),
            agent.base_url,
            agent.port,
            agent.last_heartbeat.to_rfc3339()
        );
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
