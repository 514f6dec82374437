//! Conductor CLI - simulated delegate agent, task submission and throttle control

mod client;
mod messages;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::client::{ConductorClient, DelegateStream, StreamSender};
use crate::messages::{
    AcquireOutcome, ClientMessage, ConnectionCheck, ConsumerRequest, DelegateTask,
    DelegateTaskResponse, DispatchEvent, ExecutionCapability, ExecutionOutcome, NewDelegate,
    ResponseCode, ServerMessage, TaskData, TaskRequest,
};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "CLI client for the conductor task dispatch server")]
#[command(version)]
struct Cli {
    /// Server URL
    #[arg(short, long, env = "CONDUCTOR_URL", default_value = "http://localhost:3000")]
    server: String,

    /// Account the commands act on
    #[arg(short, long, env = "CONDUCTOR_ACCOUNT", default_value = "default")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delegate agent commands
    #[command(subcommand)]
    Delegate(DelegateCommand),

    /// Task commands
    #[command(subcommand)]
    Task(TaskCommand),

    /// Resource constraint commands
    #[command(subcommand)]
    Constraint(ConstraintCommand),
}

#[derive(Subcommand)]
enum DelegateCommand {
    /// Register and run a simulated delegate over the websocket stream
    Run {
        /// Host name the delegate registers with
        #[arg(long)]
        host: String,

        /// Delegate tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// How the simulated delegate answers assigned tasks
        #[arg(long, value_enum, default_value_t = Reply::Ok)]
        reply: Reply,

        /// Seconds between heartbeats
        #[arg(long, default_value_t = 60)]
        heartbeat_secs: u64,

        /// Exit after answering one task
        #[arg(long)]
        once: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Reply {
    Ok,
    Failed,
    Retry,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Submit a task
    Submit {
        /// Task type
        #[arg(long = "type")]
        task_type: String,

        /// Required selectors
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        /// HTTP endpoints the delegate must reach
        #[arg(long)]
        http: Vec<String>,

        /// JSON parameters passed to the delegate
        #[arg(long, default_value = "null")]
        params: String,

        /// Timeout in milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Pre-assign the task to one delegate
        #[arg(long)]
        delegate: Option<Uuid>,

        /// Wait for the result
        #[arg(long)]
        sync: bool,
    },

    /// Show a task
    Get { task_id: Uuid },
}

#[derive(Subcommand)]
enum ConstraintCommand {
    /// Get or create a constraint
    Ensure {
        #[arg(long)]
        name: String,
        #[arg(long)]
        capacity: u32,
    },
    /// Acquire permits on a unit
    Acquire {
        #[arg(long)]
        constraint: Uuid,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        consumer: String,
        #[arg(long, default_value_t = 1)]
        permits: u32,
    },
    /// Release a consumer's permits
    Release {
        #[arg(long)]
        constraint: Uuid,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        consumer: String,
    },
    /// List constraints and their active holders
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let client = ConductorClient::new(&cli.server)?;

    match cli.command {
        Commands::Delegate(DelegateCommand::Run {
            host,
            tags,
            reply,
            heartbeat_secs,
            once,
        }) => run_delegate(&client, &cli.account, host, tags, reply, heartbeat_secs, once).await,
        Commands::Task(TaskCommand::Submit {
            task_type,
            tags,
            http,
            params,
            timeout_ms,
            delegate,
            sync,
        }) => {
            let request = TaskRequest {
                setup_abstractions: Default::default(),
                tags,
                capabilities: http
                    .into_iter()
                    .map(|url| ExecutionCapability::Http { url })
                    .collect(),
                data: TaskData {
                    task_type,
                    parameters: serde_json::from_str(&params)?,
                    timeout_ms,
                    is_async: !sync,
                },
                pre_assigned_delegate_id: delegate,
            };
            run_submit(&client, &cli.account, request, sync).await
        }
        Commands::Task(TaskCommand::Get { task_id }) => {
            let task = client.get_task(&cli.account, task_id).await?;
            print_task(&task);
            Ok(())
        }
        Commands::Constraint(command) => run_constraint(&client, &cli.account, command).await,
    }
}

async fn run_submit(client: &ConductorClient, account: &str, request: TaskRequest, sync: bool) -> Result<()> {
    if !sync {
        let task = client.queue_task(account, &request).await?;
        println!("Queued task {}", task.id);
        return Ok(());
    }

    match client.execute_task(account, &request).await? {
        ExecutionOutcome::Completed(completion) => {
            println!("Task {} finished: {}", completion.task_id, completion.status);
            if let Some(response) = completion.response {
                println!("{}", serde_json::to_string_pretty(&response.data)?);
            }
            if let Some(reason) = completion.error_reason {
                println!("Reason: {}", reason);
            }
        }
        ExecutionOutcome::TimedOut { task_id } => {
            println!("Task {} timed out", task_id);
        }
    }
    Ok(())
}

fn print_task(task: &DelegateTask) {
    println!("Task {} ({})", task.id, task.data.task_type);
    println!("{:─<60}", "");
    println!("  status:   {}", task.status);
    if let Some(delegate_id) = task.delegate_id {
        println!("  delegate: {}", delegate_id);
    }
    if let Some(reason) = &task.error_reason {
        println!("  reason:   {}", reason);
    }
}

async fn run_constraint(client: &ConductorClient, account: &str, command: ConstraintCommand) -> Result<()> {
    match command {
        ConstraintCommand::Ensure { name, capacity } => {
            let constraint = client.ensure_constraint(account, &name, capacity).await?;
            println!("{} {} (capacity {})", constraint.id, constraint.name, constraint.capacity);
        }
        ConstraintCommand::Acquire {
            constraint,
            unit,
            consumer,
            permits,
        } => {
            let request = ConsumerRequest {
                consumer_id: consumer.clone(),
                permits,
                release_entity_type: String::new(),
                release_entity_id: String::new(),
            };
            let response = client.acquire_permits(constraint, &unit, &request).await?;
            println!("{} is {}", consumer, response.state);
        }
        ConstraintCommand::Release {
            constraint,
            unit,
            consumer,
        } => {
            let response = client.release_permits(constraint, &unit, &consumer).await?;
            println!("Released {}", consumer);
            for instance in response.promoted {
                println!("  unblocked {} ({} permits)", instance.consumer_id, instance.permits);
            }
        }
        ConstraintCommand::List => {
            let usage = client.list_constraints(account).await?;
            if usage.is_empty() {
                println!("No constraints found.");
            }
            for entry in usage {
                let held: u32 = entry.active.iter().map(|i| i.permits).sum();
                println!(
                    "  {} - {} ({}/{} permits held)",
                    entry.constraint.id, entry.constraint.name, held, entry.constraint.capacity
                );
                for instance in entry.active {
                    println!("      {} {} x{}", instance.resource_unit, instance.consumer_id, instance.permits);
                }
            }
        }
    }
    Ok(())
}

async fn run_delegate(
    client: &ConductorClient,
    account: &str,
    host: String,
    tags: Vec<String>,
    reply: Reply,
    heartbeat_secs: u64,
    once: bool,
) -> Result<()> {
    let delegate = client
        .register_delegate(
            account,
            &NewDelegate {
                host_name: host,
                tags,
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        )
        .await?;
    println!("Registered delegate {} ({})", delegate.id, delegate.host_name);

    let mut stream = DelegateStream::connect(&client.stream_url(account, delegate.id)?).await?;
    spawn_heartbeats(stream.sender(), Duration::from_secs(heartbeat_secs.max(1)));
    stream.send(ClientMessage::Poll).await?;

    while let Some(msg) = stream.recv().await {
        match msg {
            ServerMessage::Connected { delegate_id } => {
                tracing::info!(%delegate_id, "Stream connected");
            }
            ServerMessage::Pending { tasks } => {
                for pending in tasks {
                    stream.send(ClientMessage::Acquire { task_id: pending.task_id }).await?;
                }
            }
            ServerMessage::Dispatch { event } => match event {
                DispatchEvent::TaskBroadcast { task_id, .. } => {
                    stream.send(ClientMessage::Acquire { task_id }).await?;
                }
                DispatchEvent::TaskAborted { task_id, .. } => {
                    println!("Task {} was aborted", task_id);
                }
                DispatchEvent::TaskRequeued { task_id, .. } => {
                    tracing::info!(%task_id, "Task moved to another delegate");
                }
                _ => {}
            },
            ServerMessage::Acquired { task_id, outcome } => match outcome {
                Some(AcquireOutcome::Assigned { task }) => {
                    answer(&stream, &task, reply).await?;
                    if once {
                        break;
                    }
                }
                Some(AcquireOutcome::ValidationRequired { task }) => {
                    let results = check_connectivity(&task.capabilities).await;
                    stream
                        .send(ClientMessage::Validation { task_id, results })
                        .await?;
                }
                None => tracing::debug!(%task_id, "Task not available"),
            },
            ServerMessage::ValidationRecorded { task: Some(task), .. } => {
                answer(&stream, &task, reply).await?;
                if once {
                    break;
                }
            }
            ServerMessage::Error { message } => {
                tracing::warn!("Server error: {}", message);
            }
            _ => {}
        }
    }

    Ok(())
}

fn spawn_heartbeats(sender: StreamSender, period: Duration) {
    let connection_id = Uuid::new_v4();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let heartbeat = ClientMessage::Heartbeat {
                connection_id,
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            if let Err(e) = sender.send(heartbeat).await {
                tracing::error!("Failed to send heartbeat: {}", e);
                break;
            }
        }
    });
}

async fn answer(stream: &DelegateStream, task: &DelegateTask, reply: Reply) -> Result<()> {
    println!("Running task {} ({})", task.id, task.data.task_type);
    let response = match reply {
        Reply::Ok => DelegateTaskResponse {
            response_code: ResponseCode::Ok,
            data: serde_json::json!({
                "task_type": task.data.task_type,
                "parameters": task.data.parameters,
            }),
            error_message: None,
        },
        Reply::Failed => DelegateTaskResponse {
            response_code: ResponseCode::Failed,
            data: serde_json::Value::Null,
            error_message: Some("Simulated failure".to_string()),
        },
        Reply::Retry => DelegateTaskResponse {
            response_code: ResponseCode::RetryOnOtherDelegate,
            data: serde_json::Value::Null,
            error_message: Some("Simulated retry".to_string()),
        },
    };
    stream
        .send(ClientMessage::Response {
            task_id: task.id,
            response,
        })
        .await
}

/// Try to open a TCP connection for every connectivity capability
async fn check_connectivity(capabilities: &[ExecutionCapability]) -> Vec<ConnectionCheck> {
    let mut results = Vec::new();
    for capability in capabilities {
        let (criteria, target) = match capability {
            ExecutionCapability::Http { url } => (url.trim().to_string(), http_target(url)),
            ExecutionCapability::SocketConnectivity { host, port } => {
                let target = format!("{}:{}", host.trim(), port);
                (target.clone(), Ok(target))
            }
            ExecutionCapability::Selector { .. } => continue,
        };

        let validated = match target {
            Ok(target) => reachable(&target).await,
            Err(e) => {
                tracing::warn!("Cannot check {}: {}", criteria, e);
                false
            }
        };
        tracing::info!(%criteria, validated, "Connectivity check");
        results.push(ConnectionCheck { criteria, validated });
    }
    results
}

fn http_target(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw.trim())?;
    let host = url.host_str().ok_or_else(|| anyhow!("URL has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("URL has no port"))?;
    Ok(format!("{}:{}", host, port))
}

async fn reachable(target: &str) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(5), tokio::net::TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}
