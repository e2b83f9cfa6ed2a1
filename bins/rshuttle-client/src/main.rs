//! rshuttle-client - client-side multiplexer and session manager for a
//! transparent network redirector.
//!
//! Thin CLI wrapper around `rshuttle-core`: parses arguments and the
//! environment into a `Config`, wires up logging, and hands off to the
//! library's session startup and event loop.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use rshuttle_core::acl::AclTables;
use rshuttle_core::config::{Config, DnsBypassConfig, RedisConfig, Subnet};
use rshuttle_core::session::Session;
use rshuttle_core::{eventloop, Result};
use tracing::{error, info, warn};

/// Redirect outbound traffic through a relay reached over an interactive
/// shell session.
#[derive(Parser)]
#[command(name = "rshuttle-client", version, about)]
struct Cli {
    /// Bind the IPv6 redirect/UDP listener at this address (port 0 triggers
    /// the 12300..9001 port search).
    #[arg(long, value_name = "ADDR")]
    listen_v6: Option<SocketAddr>,

    /// Bind the IPv4 redirect/UDP listener at this address.
    #[arg(long, value_name = "ADDR")]
    listen_v4: Option<SocketAddr>,

    /// Command used to reach the relay, e.g. `ssh user@host -- rshuttle-server --python`.
    #[arg(long, value_name = "ARG", required = true, num_args = 1..)]
    relay_cmd: Vec<String>,

    /// Command used to spawn the privileged firewall helper, e.g. `sudo rshuttle-firewall`.
    #[arg(long, value_name = "ARG", required = true, num_args = 1..)]
    firewall_cmd: Vec<String>,

    /// A subnet to route through the tunnel (`ip/width`, repeatable).
    #[arg(long = "include", value_name = "CIDR")]
    include: Vec<Subnet>,

    /// A subnet to exclude from the tunnel (`ip/width`, repeatable).
    #[arg(long = "exclude", value_name = "CIDR")]
    exclude: Vec<Subnet>,

    /// A nameserver to intercept and advertise to the firewall helper.
    #[arg(long = "nameserver", value_name = "IP")]
    nameservers: Vec<IpAddr>,

    /// Also redirect UDP datagrams (in addition to TCP).
    #[arg(long)]
    udp: bool,

    /// Disable mux backpressure (`TCP_STOP_SENDING`) when the relay falls behind.
    #[arg(long)]
    no_latency_control: bool,

    /// A hostname to resolve via the relay at startup (repeatable).
    #[arg(long = "seed-host", value_name = "NAME")]
    seed_hosts: Vec<String>,

    /// Redis host for live ACL reload; overrides `$REDIS_HOST`.
    #[arg(long)]
    redis_host: Option<String>,

    /// Redis port for live ACL reload; overrides `$REDIS_PORT`.
    #[arg(long, default_value_t = 6379)]
    redis_port: u16,

    /// Write the process ID to this file after startup completes.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Increase log verbosity (stacks: -v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();
}

fn build_config(cli: Cli) -> Config {
    let redis = cli
        .redis_host
        .map(|host| RedisConfig {
            host,
            port: cli.redis_port,
        })
        .or_else(RedisConfig::from_env);

    Config {
        listen_v6: cli.listen_v6,
        listen_v4: cli.listen_v4,
        relay_command: cli.relay_cmd,
        firewall_argv: cli.firewall_cmd,
        subnets_include: cli.include,
        subnets_exclude: cli.exclude.into_iter().map(Subnet::excluded).collect(),
        nameservers: cli.nameservers,
        dns_bypass: DnsBypassConfig::from_env(),
        udp_enabled: cli.udp,
        latency_control: !cli.no_latency_control,
        seed_hosts: cli.seed_hosts,
        redis,
        daemon: false,
        pidfile: cli.pidfile,
    }
}

fn write_pidfile(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "rshuttle-client exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let pidfile = cli.pidfile.clone();
    let config = build_config(cli);
    config.validate()?;

    if let Some(path) = &pidfile {
        if let Err(e) = write_pidfile(path) {
            warn!(error = %e, path = %path.display(), "failed to write pidfile");
        }
    }

    let tables = Arc::new(AclTables::new());

    if let Some(redis) = config.redis.clone() {
        #[cfg(feature = "acl-redis")]
        {
            let tables = tables.clone();
            tokio::spawn(rshuttle_core::acl::subscriber::run(
                redis.host, redis.port, tables,
            ));
        }
        #[cfg(not(feature = "acl-redis"))]
        {
            let _ = redis;
            warn!("REDIS_HOST/--redis-host set but this binary was built without the acl-redis feature; ACL reload is disabled");
        }
    } else {
        info!("no Redis coordinates configured; ACL tables stay at their closed-by-default state");
    }

    let dns_bypass = config.dns_bypass.clone().into_bypass();
    let session = Session::start(config, tables).await?;
    eventloop::run(session, dns_bypass).await
}
