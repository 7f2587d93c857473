//! Aggregator node
//!
//! Loads the startup configuration, builds the aggregator context, and runs
//! the single-threaded control loop until a signed halt commit or a fatal
//! invariant violation.
//!
//! Exit codes: 0 on a graceful (operator-signed) halt, 1 on an unrecoverable
//! internal invariant violation, 2 when the authorized-key set is missing.

#![forbid(unsafe_code)]

use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use qfabric::aggregator::{self, AggregatorContext, AggregatorParams, FeedbackLaw, WireTargets};
use qfabric::auth::CommitVerifier;
use qfabric::config::{self, ConfigError, FabricConfig};
use qfabric::net::{Micros, MonotonicClock, UdpEndpoint};

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

fn main() {
    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("aggregator: {err:#}");
            std::process::exit(1);
        }
    }
}

fn real_main() -> anyhow::Result<i32> {
    init_logging();
    let args: Vec<String> = env::args().collect();
    let config_path = parse_flag(&args, "--config").unwrap_or_else(|| "fabric.json".to_string());

    let cfg = FabricConfig::load(Path::new(&config_path))?;
    let section = cfg
        .aggregator
        .clone()
        .ok_or_else(|| anyhow::anyhow!("configuration has no aggregator section"))?;

    // The one startup failure with its own exit code: no operator keys.
    let keys = match cfg.authorized_keys() {
        Ok(keys) => keys,
        Err(ConfigError::MissingAuthorizedKeys) => {
            eprintln!("aggregator: authorized operator key set is missing; refusing to start");
            return Ok(2);
        }
        Err(err) => return Err(err.into()),
    };

    let matrix = cfg.matrix_q()?;
    let x0 = cfg.x0_q()?;
    let params = AggregatorParams {
        node_id: cfg.node_id(),
        t_cycle: Micros::from_millis(cfg.t_cycle_ms),
        k_blocks: cfg.k_blocks(),
        role: cfg.role()?,
    };
    eprintln!(
        "aggregator node {} ({:?}): {}x{} system, T_cycle {}ms, K={}",
        cfg.node_id,
        params.role,
        matrix.rows(),
        matrix.cols(),
        cfg.t_cycle_ms,
        params.k_blocks,
    );

    let node_sk = section
        .node_secret
        .as_deref()
        .map(config::parse_signing_key)
        .transpose()?;
    let peer_vk = section
        .peer_public
        .as_deref()
        .map(config::parse_verifying_key)
        .transpose()?;

    let verifier = CommitVerifier::new(keys);
    let mut ctx = AggregatorContext::new(
        params,
        matrix,
        x0,
        verifier,
        Box::new(FeedbackLaw),
        node_sk,
        peer_vk,
    )?;

    let endpoint = UdpEndpoint::bind(&section.bind)?;
    let targets = WireTargets {
        peer: resolve(&section.peer)?,
        workers: section
            .workers
            .iter()
            .map(|w| resolve(w))
            .collect::<anyhow::Result<Vec<_>>>()?,
    };
    let clock = MonotonicClock::new();

    match aggregator::run(&mut ctx, &endpoint, &clock, &targets)? {
        aggregator::RunOutcome::Halted => {
            eprintln!("aggregator: halted by operator commit");
            Ok(0)
        }
    }
}
