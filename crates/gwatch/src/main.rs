//! gw: run the gwatch scheduler or a demo capsule.
//!
//! Usage:
//!   gw scheduler [--bind IP] [--port N] [--sql-db PATH]
//!   gw capsule-demo [--events N] [--scheduler IP:PORT]
//!   gw config [--path]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gwatch_codec::CapsuleEnvelope;
use gwatch_codec::payload::SqlWrite;
use gwatch_core::broker::topology::TABLE_TRACE;
use gwatch_core::broker::{Broker, LoggingProfilerLauncher};
use gwatch_core::capsule::{Capsule, Topology, local_ip_towards};
use gwatch_core::config::{Config, ENV_CONFIG, LogFormat};
use gwatch_core::event::{Event, TICK_BEGIN, TICK_END, current_thread_ordinal};
use gwatch_core::logging::{LogConfig, LogError, init_logging};
use gwatch_core::report::NoDevice;
use gwatch_core::transport::TransportOptions;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "gw")]
#[command(about = "GPU workload tracing scheduler and capsule tools")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $GW_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Also append logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker until Ctrl-C
    Scheduler {
        #[arg(long)]
        bind: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// SQLite file for the SQL store (in-memory when unset)
        #[arg(long)]
        sql_db: Option<PathBuf>,
    },

    /// Start a capsule, emit nested synthetic events, then flush and exit
    CapsuleDemo {
        #[arg(long, default_value_t = 10)]
        events: usize,

        /// Scheduler address as IP:PORT
        #[arg(long)]
        scheduler: Option<SocketAddr>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print where the configuration was loaded from instead
        #[arg(long)]
        path: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => Self::Pretty,
            LogFormatArg::Json => Self::Json,
        }
    }
}

fn config_source(cli: &Cli) -> Option<PathBuf> {
    cli.config
        .clone()
        .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            config
                .apply_env_overrides()
                .context("invalid GW_* environment override")?;
            config
        }
        None => Config::load().context("failed to load config")?,
    };
    if let Some(level) = &cli.log_level {
        config.general.log_level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format.into();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = err
                .downcast_ref::<gwatch_core::Error>()
                .and_then(gwatch_core::Error::remediation)
            {
                eprintln!("{hint}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli)?;

    if let Command::Config { path } = &cli.command {
        if *path {
            match config_source(&cli) {
                Some(source) => println!("{}", source.display()),
                None => println!("(built-in defaults)"),
            }
        } else {
            print!("{}", config.to_toml()?);
        }
        return Ok(());
    }

    match cli.command {
        Command::Scheduler { bind, port, sql_db } => {
            if let Some(bind) = bind {
                config.scheduler.bind_ip = bind;
            }
            if let Some(port) = port {
                config.scheduler.port = port;
            }
            if sql_db.is_some() {
                config.scheduler.sql_db_path = sql_db;
            }
            let mut log = LogConfig::from_config(&config);
            log.file = cli.log_file;
            init_logging(&log).context("failed to initialize logging")?;
            run_scheduler(&config)
        }
        Command::CapsuleDemo { events, scheduler } => {
            if let Some(addr) = scheduler {
                config.capsule.scheduler_ip = addr.ip().to_string();
                config.capsule.scheduler_port = addr.port();
            }
            run_capsule_demo(config, events, cli.log_file)
        }
        Command::Config { .. } => Ok(()),
    }
}

fn run_scheduler(config: &Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(async {
        let launcher = Arc::new(LoggingProfilerLauncher::new());
        let broker = Arc::new(Broker::from_config(config, launcher)?);
        let addr = config.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr.as_str())
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(%addr, "scheduler started");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(Arc::clone(&broker).serve(
            listener,
            TransportOptions::from_config(config),
            shutdown_rx,
        ));

        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        tracing::info!(sessions = ?broker.session_counts(), "shutting down");
        let _ = shutdown.send(true);
        server.await.context("scheduler task failed")??;
        Ok::<(), anyhow::Error>(())
    })
}

/// Logs to stderr and the capsule's own file. An unwritable log dir only
/// costs the file copy.
fn init_capsule_logging(config: &Config, global_id: &str, file: Option<PathBuf>) -> Result<()> {
    let mut log = LogConfig::for_capsule(config, global_id);
    if file.is_some() {
        log.file = file;
    }
    match init_logging(&log) {
        Err(LogError::FileCreate(err)) => {
            let path = log.file.take();
            init_logging(&log).context("failed to initialize logging")?;
            tracing::warn!(?path, %err, "capsule log file unavailable, logging to stderr only");
            Ok(())
        }
        other => other.context("failed to initialize logging"),
    }
}

fn run_capsule_demo(config: Config, events: usize, log_file: Option<PathBuf>) -> Result<()> {
    let scheduler: SocketAddr = config
        .scheduler_addr()
        .parse()
        .with_context(|| format!("invalid scheduler address {}", config.scheduler_addr()))?;
    let ip = local_ip_towards(scheduler).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let connect_timeout = Duration::from_millis(config.capsule.connect_timeout_ms);

    let topology = Topology::detect(ip);
    init_capsule_logging(&config, topology.global_id(), log_file)?;
    let capsule = Capsule::new(config, topology, Arc::new(NoDevice));
    tracing::info!(
        capsule = %capsule.global_id(),
        log = %capsule.log_path().display(),
        "capsule starting"
    );
    capsule.connect()?;
    capsule.wait_connected(connect_timeout)?;

    let trace = capsule.ensure_event_trace()?;
    let thread = current_thread_ordinal();
    let mut app = Event::app("capsule-demo");
    app.record_tick(TICK_BEGIN);
    let (app_id, _) = trace.push(app)?;

    for step in 0..events {
        let mut outer = Event::cpu(format!("step-{step}"));
        outer.record_tick(TICK_BEGIN);
        let (outer_id, _) = trace.push(outer)?;
        trace.push_parent(outer_id)?;
        for name in ["load", "compute"] {
            let mut inner = Event::cpu(name);
            inner.set_metadata("step", step as u64);
            inner.record_tick(TICK_BEGIN);
            let (inner_id, _) = trace.push(inner)?;
            std::thread::sleep(Duration::from_millis(1));
            trace.record_tick(inner_id, TICK_END)?;
            trace.archive(inner_id)?;
        }
        trace.pop_parent(gwatch_core::event::EventDomain::Cpu, thread)?;
        trace.record_tick(outer_id, TICK_END)?;
        trace.archive(outer_id)?;
    }
    trace.record_tick(app_id, TICK_END)?;
    trace.archive(app_id)?;

    let mut row = std::collections::BTreeMap::new();
    row.insert("global_id".to_string(), json!(trace.name()));
    row.insert("target".to_string(), json!(capsule.global_id()));
    row.insert("type".to_string(), json!("capsule-demo"));
    capsule.send_to_scheduler(&CapsuleEnvelope::new(
        "",
        SqlWrite {
            table_name: TABLE_TRACE.to_string(),
            insert_data: row,
        },
    ))?;

    let report = capsule.shutdown();
    println!(
        "{}",
        json!({
            "capsule": capsule.global_id(),
            "reported": report.events.reported,
            "send_failures": report.events.send_failures,
            "dropped": report.events.dropped,
            "flushed": report.flushed,
        })
    );
    Ok(())
}
