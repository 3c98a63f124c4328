use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tabled::{Table, Tabled};

mod client;

use client::{Client, Container, Operation};

#[derive(Parser)]
#[command(name = "xlxc")]
#[command(about = "CLI for the xlxd container daemon", long_about = None)]
struct Cli {
    /// REST API address
    #[arg(short, long, default_value = "http://127.0.0.1:8443")]
    server: String,

    /// Bearer token for trusted access
    #[arg(long)]
    token: Option<String>,

    /// Print the operation instead of waiting for it
    #[arg(long, global = true)]
    no_wait: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show client and server versions
    Version,

    /// Show server information
    Info,

    /// List all containers
    List,

    /// Show container details
    Show {
        /// Container name
        name: String,
    },

    /// Create a new container
    Create {
        /// Container name
        name: String,
    },

    /// Delete a stopped container
    Delete {
        /// Container name
        name: String,
    },

    /// Start a container
    Start {
        /// Container name
        name: String,
    },

    /// Stop a container
    Stop {
        /// Container name
        name: String,

        /// Seconds to wait for a clean stop (0 = wait indefinitely)
        #[arg(short, long, default_value = "30")]
        timeout: i64,

        /// Stop even if frozen
        #[arg(short, long)]
        force: bool,
    },

    /// Restart a container
    Restart {
        /// Container name
        name: String,

        /// Seconds to wait for a clean stop (0 = wait indefinitely)
        #[arg(short, long, default_value = "30")]
        timeout: i64,

        /// Restart even if frozen
        #[arg(short, long)]
        force: bool,
    },

    /// Freeze all processes of a container
    Freeze {
        /// Container name
        name: String,
    },

    /// Thaw a frozen container
    Unfreeze {
        /// Container name
        name: String,
    },

    /// Snapshot a container
    Snapshot {
        /// Container name
        name: String,

        /// Snapshot name (defaults to snapN)
        snapshot: Option<String>,

        /// Include runtime state
        #[arg(long)]
        stateful: bool,
    },

    /// Run a command in a container and print its output
    Exec {
        /// Container name
        name: String,

        /// Environment variables (KEY=VALUE)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Manage background operations
    #[command(subcommand)]
    Operation(OperationCommands),

    /// Stream events from the server
    Monitor {
        /// Event types to show (operation, logging, lifecycle)
        #[arg(long = "type")]
        types: Vec<String>,
    },
}

#[derive(Subcommand)]
enum OperationCommands {
    /// List operations
    List,

    /// Show an operation
    Show {
        /// Operation ID
        id: String,
    },

    /// Wait for an operation to finish
    Wait {
        /// Operation ID
        id: String,

        /// Seconds to wait (negative = forever)
        #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
        timeout: i64,
    },

    /// Cancel a running operation, or delete a finished one
    Cancel {
        /// Operation ID
        id: String,
    },
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "SNAPSHOTS")]
    snapshots: usize,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<Container> for ContainerRow {
    fn from(c: Container) -> Self {
        Self {
            name: c.name,
            state: c.status.to_lowercase(),
            snapshots: c.snapshots.len(),
            created: c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
struct OperationRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "CLASS")]
    class: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CANCELABLE")]
    may_cancel: String,
    #[tabled(rename = "CREATED")]
    created: String,
}

impl From<Operation> for OperationRow {
    fn from(op: Operation) -> Self {
        Self {
            id: op.id,
            class: op.class,
            description: op.description,
            status: op.status.to_lowercase(),
            may_cancel: if op.may_cancel { "yes" } else { "no" }.to_string(),
            created: op.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

fn print_operation(op: &Operation) {
    println!("ID:          {}", op.id);
    println!("Class:       {}", op.class);
    println!("Description: {}", op.description);
    println!("Status:      {} ({})", op.status.to_lowercase(), op.status_code);
    println!("Created:     {}", op.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Updated:     {}", op.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Cancelable:  {}", if op.may_cancel { "yes" } else { "no" });
    if !op.resources.is_empty() {
        println!("Resources:");
        for (class, urls) in &op.resources {
            println!("  {}:", class);
            for url in urls {
                println!("  - {}", url);
            }
        }
    }
    if op.metadata.as_object().is_some_and(|m| !m.is_empty()) {
        println!("Metadata:    {}", op.metadata);
    }
    if !op.err.is_empty() {
        println!("Error:       {}", op.err);
    }
}

fn parse_env(env: &[String]) -> Result<Value> {
    let mut map = serde_json::Map::new();
    for entry in env {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("invalid environment entry '{}', expected KEY=VALUE", entry);
        };
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Value::Object(map))
}

/// Submit-and-wait helper shared by every container action.
async fn run(client: &Client, no_wait: bool, op: Operation, done_msg: &str) -> Result<()> {
    if no_wait {
        println!("Operation: {}", op.id);
        return Ok(());
    }
    client.wait_for_success(&op).await?;
    println!("{}", done_msg);
    Ok(())
}

/// Print server-sent events until the stream ends.
async fn monitor(client: &Client, types: &[String]) -> Result<()> {
    let response = client.events(types).await?;
    let mut stream = response.bytes_stream();
    let mut buf = String::new();
    let mut event_name = String::new();

    while let Some(chunk) = stream.next().await {
        buf.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                match serde_json::from_str::<Value>(data) {
                    Ok(value) => println!(
                        "[{}] {}",
                        event_name,
                        serde_json::to_string_pretty(&value)?
                    ),
                    Err(_) => println!("[{}] {}", event_name, data),
                }
            } else if line.is_empty() {
                event_name.clear();
            }
        }
    }
    println!("Event stream closed by server");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new(&cli.server, cli.token);
    let no_wait = cli.no_wait;

    match cli.command {
        Commands::Version => {
            println!("Client version: {}", env!("CARGO_PKG_VERSION"));
            let info = client.server_info().await?;
            match info.environment {
                Some(env) => println!("Server version: {}", env.server_version),
                None => println!("Server version: unknown (untrusted)"),
            }
        }

        Commands::Info => {
            let info = client.server_info().await?;
            println!("API:     {}", info.api_compat);
            println!("Auth:    {}", info.auth);
            if let Some(env) = info.environment {
                println!("Server:  {} {}", env.server, env.server_version);
                println!("Backend: {}", env.backend);
                println!(
                    "Kernel:  {} {} ({})",
                    env.kernel, env.kernel_version, env.kernel_architecture
                );
                println!("PID:     {}", env.server_pid);
                println!(
                    "Operations: {}/{}",
                    env.operations_active, env.operations_limit
                );
                println!(
                    "Event listeners: {} ({} events dropped)",
                    env.event_listeners, env.events_dropped
                );
            }
        }

        Commands::List => {
            let containers = client.containers().await?;
            if containers.is_empty() {
                println!("No containers found");
            } else {
                let rows: Vec<ContainerRow> =
                    containers.into_iter().map(ContainerRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Show { name } => {
            let c = client.container(&name).await?;
            println!("Name:    {}", c.name);
            println!("State:   {}", c.status.to_lowercase());
            println!("Created: {}", c.created_at.format("%Y-%m-%d %H:%M:%S"));
            if !c.snapshots.is_empty() {
                println!("Snapshots:");
                for snap in &c.snapshots {
                    println!(
                        "  - {} ({}stateful, {})",
                        snap.name,
                        if snap.stateful { "" } else { "not " },
                        snap.created_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Create { name } => {
            let op = client.create_container(&name).await?;
            run(&client, no_wait, op, &format!("Created container: {}", name)).await?;
        }

        Commands::Delete { name } => {
            let op = client.delete_container(&name).await?;
            run(&client, no_wait, op, &format!("Deleted container: {}", name)).await?;
        }

        Commands::Start { name } => {
            let op = client
                .update_state(&name, json!({ "action": "start" }))
                .await?;
            run(&client, no_wait, op, &format!("Started container: {}", name)).await?;
        }

        Commands::Stop {
            name,
            timeout,
            force,
        } => {
            let op = client
                .update_state(
                    &name,
                    json!({ "action": "stop", "timeout": timeout, "force": force }),
                )
                .await?;
            run(&client, no_wait, op, &format!("Stopped container: {}", name)).await?;
        }

        Commands::Restart {
            name,
            timeout,
            force,
        } => {
            let op = client
                .update_state(
                    &name,
                    json!({ "action": "restart", "timeout": timeout, "force": force }),
                )
                .await?;
            run(&client, no_wait, op, &format!("Restarted container: {}", name)).await?;
        }

        Commands::Freeze { name } => {
            let op = client
                .update_state(&name, json!({ "action": "freeze" }))
                .await?;
            run(&client, no_wait, op, &format!("Froze container: {}", name)).await?;
        }

        Commands::Unfreeze { name } => {
            let op = client
                .update_state(&name, json!({ "action": "unfreeze" }))
                .await?;
            run(&client, no_wait, op, &format!("Unfroze container: {}", name)).await?;
        }

        Commands::Snapshot {
            name,
            snapshot,
            stateful,
        } => {
            if snapshot.as_deref().is_some_and(|s| s.contains('/')) {
                bail!("snapshot names may not contain '/'");
            }
            let op = client
                .snapshot(&name, json!({ "name": snapshot, "stateful": stateful }))
                .await?;
            run(&client, no_wait, op, &format!("Snapshotted container: {}", name)).await?;
        }

        Commands::Exec { name, env, command } => {
            let body = json!({
                "command": command,
                "environment": parse_env(&env)?,
                "record-output": true,
            });
            let op = client.exec(&name, body).await?;
            if no_wait {
                println!("Operation: {}", op.id);
                return Ok(());
            }
            let done = client.wait_for_success(&op).await?;
            let output = &done.metadata["output"];
            if let Some(stdout) = output["1"].as_str() {
                print!("{}", stdout);
            }
            if let Some(stderr) = output["2"].as_str() {
                eprint!("{}", stderr);
            }
            let code = done.metadata["return"].as_i64().unwrap_or(0);
            if code != 0 {
                std::process::exit(code as i32);
            }
        }

        Commands::Operation(cmd) => match cmd {
            OperationCommands::List => {
                let ops: Vec<Operation> = client
                    .operations()
                    .await?
                    .into_values()
                    .flatten()
                    .collect();
                if ops.is_empty() {
                    println!("No operations found");
                } else {
                    let mut rows: Vec<OperationRow> =
                        ops.into_iter().map(OperationRow::from).collect();
                    rows.sort_by(|a, b| a.created.cmp(&b.created));
                    println!("{}", Table::new(rows));
                }
            }
            OperationCommands::Show { id } => {
                print_operation(&client.operation(&id).await?);
            }
            OperationCommands::Wait { id, timeout } => {
                let op = client.wait(&id, timeout).await?;
                print_operation(&op);
            }
            OperationCommands::Cancel { id } => {
                let op = client.cancel_operation(&id).await?;
                if op.is_terminal() && op.status != "Cancelled" {
                    println!("Deleted operation: {}", op.id);
                } else {
                    println!("Cancelled operation: {} ({})", op.id, op.status.to_lowercase());
                }
            }
        },

        Commands::Monitor { types } => {
            monitor(&client, &types).await?;
        }
    }

    Ok(())
}
