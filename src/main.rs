use clap::{Parser, Subcommand};
use mend_core::{
    agent::{RunnerClient, Worker},
    api::{self, ApiState},
    collab::Collaborators,
    commands::CommandRouter,
    config::Config,
    constants,
    lifecycle::TaskLifecycle,
    logs::LogChannel,
    models::{Origin, Priority, Provider, Target, TaskKind},
    monitoring::Metrics,
    queue::{MemoryWorkQueue, WorkQueue},
    repocache::RepoCacheManager,
    store::{MemoryTaskStore, TaskStore},
    tokens::{EnvTokenBroker, TokenBroker},
    webhooks::{self, DispatcherState},
    MendError,
};
use std::process::ExitCode;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// sysexits-style process exit codes.
const EX_USAGE: u8 = 64;
const EX_UNAVAILABLE: u8 = 69;
const EX_SOFTWARE: u8 = 70;

#[derive(Parser)]
#[command(name = "mend-core", version, about = "Autonomous bug-fixing orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the webhook dispatcher, workers, and read API
    Serve,
    /// Start workers only
    Worker,
    /// Administrative enqueue of a task
    Enqueue {
        #[arg(long)]
        kind: TaskKind,
        /// Target repository, `owner/name`
        #[arg(long)]
        target: String,
        /// Optional PR/issue reference on the target
        #[arg(long)]
        reference: Option<String>,
        #[arg(long, default_value = "issue-tracker")]
        provider: Provider,
        #[arg(long, default_value = "default")]
        organization: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    /// Apply schema migrations for the configured backends
    Migrate,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Print a task record with its execution chain
    Get { id: String },
    /// Cancel a non-terminal task
    Cancel { id: String },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Print ready, in-flight, and dead-letter items
    Inspect,
}

/// Shared service graph, assembled once per process.
struct App {
    config: Config,
    lifecycle: Arc<TaskLifecycle>,
    commands: Arc<CommandRouter>,
    broker: Arc<dyn TokenBroker>,
    cache: Arc<RepoCacheManager>,
    metrics: Arc<Metrics>,
}

fn build_app(config: Config) -> App {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new(
        config.queue.high_water,
        config.queue.block_on_full,
        config.worker.max_attempts,
    ));
    let logs = Arc::new(LogChannel::new(
        config.logs.max_lines_per_task,
        config.logs.retention_seconds,
    ));
    let (collab, _outbox) = Collaborators::logging();
    let metrics = Arc::new(Metrics::new());

    let lifecycle = Arc::new(TaskLifecycle::new(
        store.clone(),
        queue,
        logs,
        collab,
        metrics.clone(),
    ));
    let commands = Arc::new(CommandRouter::new(lifecycle.clone(), metrics.clone()));
    let broker: Arc<dyn TokenBroker> = Arc::new(EnvTokenBroker::new(store));
    let cache = Arc::new(RepoCacheManager::new(
        config.repo_cache.clone(),
        broker.clone(),
        metrics.clone(),
    ));

    App {
        config,
        lifecycle,
        commands,
        broker,
        cache,
        metrics,
    }
}

fn exit_for(error: &MendError) -> u8 {
    match error {
        MendError::Validation(_) | MendError::Configuration(_) => EX_USAGE,
        MendError::QueueFull { .. }
        | MendError::TokenUnavailable { .. }
        | MendError::CacheBusy { .. } => EX_UNAVAILABLE,
        _ => EX_SOFTWARE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's own exit code is 2; this binary promises 64 for
            // usage errors (0 for --help/--version).
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EX_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(EX_USAGE);
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(exit_for(&e))
        }
    }
}

async fn run(command: Command, config: Config) -> mend_core::Result<()> {
    match command {
        Command::Serve => serve(build_app(config), true).await,
        Command::Worker => serve(build_app(config), false).await,
        Command::Enqueue {
            kind,
            target,
            reference,
            provider,
            organization,
            priority,
        } => {
            let app = build_app(config);
            let origin = Origin {
                provider,
                organization_id: organization,
                event_id: format!("admin-{}", Uuid::new_v4()),
                actor: Some("operator".to_string()),
            };
            let mut task_target = Target::new(target);
            if let Some(reference) = reference {
                task_target = task_target.with_reference(reference);
            }
            let created = app
                .lifecycle
                .create_task(origin, task_target, kind, priority)
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "status": if created.deduplicated { "duplicate" } else { "queued" },
                    "task_id": created.task.id,
                }))?
            );
            Ok(())
        }
        Command::Task { command } => {
            let app = build_app(config);
            match command {
                TaskCommand::Get { id } => {
                    let task = app.lifecycle.store().get(&id).await?;
                    let executions = app.lifecycle.store().executions(&id).await?;
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "task": task,
                            "executions": executions,
                        }))?
                    );
                }
                TaskCommand::Cancel { id } => {
                    let task = app.lifecycle.cancel(&id, "operator").await?;
                    println!("Task {} is now {}", task.id, task.status);
                }
            }
            Ok(())
        }
        Command::Queue { command } => {
            let app = build_app(config);
            match command {
                QueueCommand::Inspect => {
                    let snapshot = app.lifecycle.queue().inspect().await;
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
            }
            Ok(())
        }
        Command::Migrate => {
            // The memory engine has no schema; the value of the command is
            // failing early on a bad DSN.
            info!(
                "Backends validated (store: {}, queue: {}, logs: {}); nothing to migrate",
                config.backends.store_dsn, config.backends.queue_dsn, config.backends.log_dsn
            );
            Ok(())
        }
    }
}

/// Run the long-lived process: workers and sweepers, plus the HTTP
/// surface when `with_http` is set.
async fn serve(app: App, with_http: bool) -> mend_core::Result<()> {
    info!("Starting mend-core");
    let runner = Arc::new(RunnerClient::new(&app.config.runner).await?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();

    for n in 0..app.config.worker.worker_count {
        let worker = Worker::new(
            format!("worker-{n}"),
            app.lifecycle.clone(),
            runner.clone(),
            app.cache.clone(),
            app.broker.clone(),
            app.metrics.clone(),
            app.config.worker.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    // Retention sweeps for logs and terminal tasks.
    {
        let lifecycle = app.lifecycle.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(
                        constants::LOG_SWEEP_INTERVAL_SECS,
                    )) => {}
                    _ = shutdown.changed() => return,
                }
                let now = chrono::Utc::now();
                lifecycle.logs().sweep(now).await;
                if let Err(e) = lifecycle.store().sweep(now).await {
                    error!("Store sweep failed: {e}");
                }
            }
        }));
    }

    if with_http {
        let api_router = api::router(ApiState {
            lifecycle: app.lifecycle.clone(),
            metrics: app.metrics.clone(),
        });
        let webhook_router = webhooks::dispatcher_router(
            webhooks::builtin_registry(),
            DispatcherState {
                lifecycle: app.lifecycle.clone(),
                commands: app.commands.clone(),
                secrets: Arc::new(app.config.webhooks.clone()),
                metrics: app.metrics.clone(),
            },
        );
        let router = api_router
            .merge(webhook_router)
            .layer(TraceLayer::new_for_http());

        let listen_addr = app.config.server.listen_addr.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(&listen_addr, router).await {
                error!("HTTP server failed: {e}");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| MendError::Internal(e.into()))?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        task.abort();
    }
    Ok(())
}
