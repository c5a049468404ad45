use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mape_controller::{
    BehaviorSpec, Controller, ControllerConfig, ControllerRuntime, KnowledgeBase,
};
use shared_event_bus::{EventPublisher, FanoutPublisher, FileEventPublisher, MemoryEventBus};
use shared_logging::LogLevel;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "mape", version, about = "MAPE swarm agent controller")]
struct Cli {
    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_filter: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs the controller loop.
    Run(RunArgs),
    /// Lists the registered platforms and algorithms.
    List,
    /// Validates a configuration file and prints it resolved.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    id: Option<u64>,
    #[arg(long)]
    processes: Option<u64>,
    #[arg(long)]
    platform: Option<String>,
    #[arg(long)]
    algorithm: Option<String>,
    /// Accent to add; repeatable.
    #[arg(long = "accent")]
    accents: Vec<String>,
    #[arg(long, allow_negative_numbers = true)]
    loop_period: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    max_runtime: Option<f64>,
    #[arg(long, allow_negative_numbers = true)]
    send_period: Option<f64>,
    /// Controller log file (JSON lines).
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<LogLevel>,
    /// Appends knowledge broadcasts and telemetry events to this file.
    #[arg(long)]
    event_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_filter)?;
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::List => {
            let controller = Controller::new(KnowledgeBase::new("mape.list"));
            print!("{}", controller.platform_registry().help());
            print!("{}", controller.algorithm_registry().help());
            Ok(())
        }
        Commands::Check { config } => {
            let config = ControllerConfig::load(&config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("creating log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

fn resolve_config(args: &RunArgs) -> Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(id) = args.id {
        config.agent.id = id;
    }
    if let Some(processes) = args.processes {
        config.agent.processes = processes;
    }
    if let Some(name) = &args.platform {
        config.platform = Some(BehaviorSpec::named(name.as_str()));
    }
    if let Some(name) = &args.algorithm {
        config.algorithm = Some(BehaviorSpec::named(name.as_str()));
    }
    config
        .accents
        .extend(args.accents.iter().map(|name| BehaviorSpec::named(name.as_str())));
    if let Some(loop_period) = args.loop_period {
        config.timing.loop_period = loop_period;
    }
    if let Some(max_runtime) = args.max_runtime {
        config.timing.max_runtime = max_runtime;
    }
    if let Some(send_period) = args.send_period {
        config.timing.send_period = send_period;
    }
    if let Some(path) = &args.log_file {
        config.logging.path = Some(path.clone());
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    Ok(config)
}

fn handle_run(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let file_events = args
        .event_log
        .as_ref()
        .map(FileEventPublisher::new)
        .transpose()
        .context("opening event log")?
        .map(Arc::new);

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        let events = file_events
            .clone()
            .map(|publisher| publisher as Arc<dyn EventPublisher>);
        let mut agent = ControllerRuntime::from_config(&config, events)?;

        let bus = Arc::new(MemoryEventBus::new(1024));
        agent.connect(Arc::clone(&bus)).await?;
        if let Some(file) = file_events {
            let fanout = FanoutPublisher::new().with(bus).with(file);
            agent.controller().knowledge().attach_transport(Arc::new(fanout));
        }

        tracing::info!(
            run_id = %agent.run_id(),
            agent = config.agent.id,
            processes = config.agent.processes,
            "controller starting"
        );
        let status = tokio::select! {
            status = agent.run() => Some(status),
            _ = tokio::signal::ctrl_c() => None,
        };
        match status {
            Some(status) => {
                let metrics = agent.controller().metrics();
                tracing::info!(
                    status = %status,
                    cycles = metrics.cycles,
                    broadcasts = metrics.broadcasts,
                    "controller finished"
                );
            }
            None => tracing::warn!("interrupted, shutting down"),
        }
        print_self(agent.controller());
        agent.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}

fn print_self(controller: &Controller) {
    let prefix = format!("{}.", controller.self_record().device.prefix());
    for key in controller.knowledge().keys_with_prefix(&prefix) {
        let value = controller.knowledge().get(&key).unwrap_or_default();
        println!("{key} = {value}");
    }
}
