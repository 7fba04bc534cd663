//! The switchboard daemon binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use switchboard_broker::logging::{level_for, LogControl};
use switchboard_broker::lock::{mount_path, FileLock, HttpPortFile};
use switchboard_broker::server::{self, ServerOptions};
use switchboard_broker::{real_port, DEFAULT_MOUNTPOINT, DEFAULT_ROOT, HTTP_PORT, MASTER_PORT, SLAVE_PORT};
use tracing_subscriber::{reload, EnvFilter};

#[derive(Parser)]
#[command(
    name = "switchboard",
    about = "Service registry and notification broker"
)]
struct Cli {
    /// Verbosity level; may be given multiple times.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// The broker "mountpoint" (unix stream socket path below the root).
    #[arg(short = 'p', default_value = DEFAULT_MOUNTPOINT)]
    mountpoint: String,

    /// Do not daemonize; stay in the foreground.
    #[arg(short = 'd')]
    foreground: bool,

    /// Copy debug messages to the console (stderr).
    #[arg(short = 'c')]
    console: bool,

    /// Enable TCP/IP master support (listen for slave brokers).
    #[arg(short = 't')]
    tcp_master: bool,

    /// Like -t, with a comma separated list of IPs to bind.
    #[arg(short = 'b', value_delimiter = ',')]
    bind: Vec<std::net::Ipv4Addr>,

    /// Address of the upstream master broker, e.g. 127.0.0.1:3746.
    #[arg(short = 'm')]
    master: Option<SocketAddr>,

    /// Load interface rules from this file.
    #[arg(short = 'f')]
    config: Option<PathBuf>,

    /// Broker id for tree mode; must be >= 1.
    #[arg(short = 'i')]
    id: Option<u32>,

    /// Asynchronous attach mode: unblock clients immediately.
    #[arg(short = 'a')]
    async_attach: bool,

    /// Enable the remote-server cache (requires tree mode).
    #[arg(short = 'C')]
    cache: bool,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Some(id) = cli.id {
        if id < 1 {
            eprintln!("invalid servicebroker identifier: {id}, must be >= 1");
            return std::process::ExitCode::FAILURE;
        }
    }

    let log = init_logging(cli.verbose as usize);

    if !cli.foreground {
        daemonize();
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("cannot start runtime: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli, log)) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, log: LogControl) -> anyhow::Result<()> {
    let root = std::env::var("FND_SERVICEBROKER_ROOT").unwrap_or_else(|_| DEFAULT_ROOT.into());

    tracing::info!(
        "servicebroker {} started",
        if cli.master.is_some() { "slave" } else { "master" }
    );
    tracing::info!("mountpoint: {}", cli.mountpoint);
    if let Some(id) = cli.id {
        tracing::info!("id: {id}");
    }

    // One daemon per mountpoint.
    let lock_path = mount_path(&root, &cli.mountpoint, ".lck");
    let _lock = FileLock::acquire(&lock_path)
        .with_context(|| format!("lock failed on {}", lock_path.display()))?;

    let http_port = real_port(HTTP_PORT);
    let _port_file = HttpPortFile::write(mount_path(&root, &cli.mountpoint, ".http"), http_port);

    let mut options = ServerOptions::new(mount_path(&root, &cli.mountpoint, ""));
    options.enable_tcp_master = cli.tcp_master || !cli.bind.is_empty();
    options.bind_ips = cli.bind;
    options.master_address = cli.master;
    options.config_file = cli.config;
    options.tree_id = cli.id;
    options.use_cache = cli.cache;
    options.async_attach = cli.async_attach;
    options.master_port = real_port(MASTER_PORT);
    options.slave_port = real_port(SLAVE_PORT);
    options.http_port = http_port;
    options.log = log;

    let handle = server::start(options).await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = handle.shutdown.cancelled() => {}
        _ = tokio::signal::ctrl_c() => handle.stop(),
        _ = sigterm.recv() => handle.stop(),
    }

    // Give connection tasks a moment to drain.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Ok(())
}

fn init_logging(verbosity: usize) -> LogControl {
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::default().add_directive(level_for(verbosity).into());
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    LogControl::new(
        verbosity,
        Arc::new(move |level| {
            let _ = handle.reload(EnvFilter::default().add_directive(level.into()));
        }),
    )
}

/// Classic double fork; the daemon must detach before the runtime starts.
fn daemonize() {
    unsafe {
        match libc::fork() {
            -1 => std::process::exit(1),
            0 => {}
            _ => std::process::exit(0),
        }
        libc::setsid();
        match libc::fork() {
            -1 => std::process::exit(1),
            0 => {}
            _ => std::process::exit(0),
        }
    }
}
