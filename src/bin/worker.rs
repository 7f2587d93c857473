//! Worker node
//!
//! Holds the system matrix, evaluates coded tasks, answers every
//! aggregator. Terminates only on signal or a fatal dimension disagreement
//! with the fleet (exit code 1).

#![forbid(unsafe_code)]

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use qfabric::config::FabricConfig;
use qfabric::net::UdpEndpoint;
use qfabric::worker::{run_worker, WorkerContext};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if env::var("QFABRIC_LOG_JSON").ok().as_deref() == Some("1") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn resolve(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("address `{addr}` resolves to nothing"))
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args: Vec<String> = env::args().collect();
    let config_path = parse_flag(&args, "--config").unwrap_or_else(|| "fabric.json".to_string());

    let cfg = FabricConfig::load(Path::new(&config_path))?;
    let section = cfg
        .worker
        .clone()
        .ok_or_else(|| anyhow::anyhow!("configuration has no worker section"))?;

    let matrix = cfg.matrix_q()?;
    eprintln!(
        "worker node {}: {}x{} system, answering {} aggregator(s)",
        cfg.node_id,
        matrix.rows(),
        matrix.cols(),
        section.aggregators.len(),
    );

    let endpoint = UdpEndpoint::bind(&section.bind)?;
    let aggregators = section
        .aggregators
        .iter()
        .map(|a| resolve(a))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut ctx = WorkerContext::new(matrix);
    run_worker(&mut ctx, &endpoint, &aggregators)?;
    Ok(())
}
