use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rdma_echo::bench;
use rdma_echo::config::{BenchConfig, EngineKind, NodeIdentity, Role};

#[derive(Debug, Parser)]
#[clap(name = "rdma-echo", version = "0.1.0")]
pub struct Args {
    /// Cluster configuration file
    config: PathBuf,
    /// Handshake port, overrides the config file
    port: Option<u16>,
    /// Role of this node, looked up by host name when absent
    #[arg(long, value_enum)]
    role: Option<Role>,
    /// Rank of this node within its role
    #[arg(long)]
    rank: Option<u32>,
    /// Write the log to server[<rank>].log / client[<rank>].log in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Worker threads, overrides the config file
    #[arg(long, short = 't')]
    threads: Option<usize>,
    /// Data path, overrides the config file
    #[arg(long, short = 'e', value_enum)]
    engine: Option<EngineKind>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `server[<rank>].log` or `client[<rank>].log` under `dir`.
fn log_path(dir: &Path, id: &NodeIdentity) -> PathBuf {
    dir.join(format!("{}[{}].log", id.role.as_str(), id.rank))
}

/// Installed as soon as the node knows who it is; errors before that only reach stderr.
fn init_logging(log_dir: Option<&Path>, id: &NodeIdentity) {
    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        return;
    };

    let path = log_path(dir, id);
    match File::create(&path) {
        Ok(file) => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        Err(err) => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
            warn!(path = %path.display(), error = %err, "failed to open log file, logging to stderr");
        },
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // the log file is named after our identity, which comes from the config
    let mut config = BenchConfig::from_file(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    let id = config.identify(args.role, args.rank)?;

    init_logging(args.log_dir.as_deref(), &id);

    let caps = config.capabilities(id.role);
    info!("==== {} {} ====", id.role.as_str(), id.rank);
    info!(
        msg_size = config.msg_size,
        num_concurr_msgs = config.num_concurr_msgs,
        port = config.port,
        engine = ?config.engine,
        threads = config.threads,
        multi_peer = caps.multi_peer,
        shared_receive_queue = caps.shared_receive_queue,
        batched_signaling = caps.batched_signaling,
        "configuration"
    );

    let report = bench::run(&config, id)?;
    report.log();
    info!("==== {} {} done ====", id.role.as_str(), id.rank);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Role::Server, 0, "server[0].log")]
    #[case(Role::Client, 12, "client[12].log")]
    fn test_log_path(#[case] role: Role, #[case] rank: u32, #[case] name: &str) {
        let path = log_path(Path::new("/tmp/bench"), &NodeIdentity { role, rank });
        assert_eq!(path, Path::new("/tmp/bench").join(name));
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from(["rdma-echo", "cluster.toml", "19000", "--role", "client", "--rank", "2", "-e", "one-sided"]);
        assert_eq!(args.port, Some(19000));
        assert_eq!(args.role, Some(Role::Client));
        assert_eq!(args.rank, Some(2));
        assert_eq!(args.engine, Some(EngineKind::OneSided));
        assert_eq!(args.threads, None);
    }
}
