//! Startup configuration
//!
//! Everything the core treats as pre-provisioned arrives through one JSON
//! file read at startup: node identity, peer addresses, timing, the
//! bootstrap `(M, x, K)`, and the authorized operator keys. The file is
//! trusted local input (the air-gap is the boundary), but it is still
//! validated aggressively: a fabric that comes up with a ragged matrix or a
//! truncated key would fail in ways far harder to diagnose later.
//!
//! Matrix and input values are given as decimals in `[-1, 1)` and converted
//! to Q1.31 here, on the configuration path only. A BLAKE3 digest of the
//! raw file is logged so operators can audit which configuration a node is
//! actually running.
//!
//! A missing or empty authorized-key set is the one startup error with its
//! own exit code (2): a fabric that cannot verify operator commits must not
//! come up at all.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::fixed::{Matrix, Q31};
use crate::wire::{NodeId, Role};

/// Default redundancy factor `ρ`.
pub const DEFAULT_REDUNDANCY: f64 = 0.5;

fn default_redundancy() -> f64 {
    DEFAULT_REDUNDANCY
}

/// Errors surfaced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("authorized operator key set is missing or empty")]
    MissingAuthorizedKeys,
    #[error("bad key material: {0}")]
    BadKey(String),
    #[error("bad matrix: {0}")]
    BadMatrix(String),
    #[error("input width {got} does not match matrix columns {want}")]
    BadInput { got: usize, want: usize },
    #[error("value {0} outside the representable range [-1, 1)")]
    OutOfRange(f64),
    #[error("unknown role `{0}` (expected `primary` or `backup`)")]
    BadRole(String),
}

/// Aggregator-only settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AggregatorSection {
    /// `primary` or `backup`.
    pub role: String,
    /// Control-socket bind address.
    pub bind: String,
    /// The other aggregator.
    pub peer: String,
    /// Worker pool addresses (unicast fan-out or one multicast group).
    pub workers: Vec<String>,
    /// Hex Ed25519 secret for signing resync frames.
    #[serde(default)]
    pub node_secret: Option<String>,
    /// Hex Ed25519 public key of the peer aggregator.
    #[serde(default)]
    pub peer_public: Option<String>,
    /// Hex Ed25519 public keys of authorized operators.
    pub authorized_keys: Vec<String>,
}

/// Worker-only settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerSection {
    /// Control-socket bind address.
    pub bind: String,
    /// Both aggregators; results go to every one of them.
    pub aggregators: Vec<String>,
}

/// The whole startup file. The matrix and `x` sections are shared by both
/// node kinds; role-specific sections are optional.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FabricConfig {
    pub node_id: u64,
    /// Control period in milliseconds (target 10 to 20 Hz).
    pub t_cycle_ms: u64,
    /// Redundancy factor `ρ`; `K = ⌈m·(1+ρ)⌉`.
    #[serde(default = "default_redundancy")]
    pub redundancy: f64,
    /// Row-major system matrix, decimals in `[-1, 1)`.
    pub matrix: Vec<Vec<f64>>,
    /// Bootstrap input vector.
    pub x0: Vec<f64>,
    #[serde(default)]
    pub aggregator: Option<AggregatorSection>,
    #[serde(default)]
    pub worker: Option<WorkerSection>,
}

impl FabricConfig {
    /// Read and parse a configuration file, logging its digest.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let digest = blake3::hash(&raw);
        tracing::info!(
            path = %path.display(),
            digest = %digest.to_hex(),
            "configuration loaded"
        );
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    /// Convert the matrix section, validating shape and range.
    pub fn matrix_q(&self) -> Result<Matrix, ConfigError> {
        let rows = self.matrix.len();
        if rows == 0 {
            return Err(ConfigError::BadMatrix("no rows".into()));
        }
        let cols = self.matrix[0].len();
        if cols == 0 {
            return Err(ConfigError::BadMatrix("no columns".into()));
        }
        let mut elems = Vec::with_capacity(rows * cols);
        for (i, row) in self.matrix.iter().enumerate() {
            if row.len() != cols {
                return Err(ConfigError::BadMatrix(format!(
                    "row {} has {} columns, row 1 has {cols}",
                    i + 1,
                    row.len()
                )));
            }
            for v in row {
                elems.push(q31_checked(*v)?);
            }
        }
        Matrix::new_r(rows, cols, elems)
            .map_err(|e| ConfigError::BadMatrix(e.to_string()))
    }

    /// Convert the bootstrap input, validating against the matrix width.
    pub fn x0_q(&self) -> Result<Vec<Q31>, ConfigError> {
        let cols = self.matrix.first().map(|r| r.len()).unwrap_or(0);
        if self.x0.len() != cols {
            return Err(ConfigError::BadInput { got: self.x0.len(), want: cols });
        }
        self.x0.iter().map(|v| q31_checked(*v)).collect()
    }

    /// `K = ⌈m·(1+ρ)⌉`.
    pub fn k_blocks(&self) -> u32 {
        let m = self.matrix.len() as f64;
        (m * (1.0 + self.redundancy)).ceil() as u32
    }

    /// Parse the aggregator role string.
    pub fn role(&self) -> Result<Role, ConfigError> {
        let section = self.aggregator.as_ref().ok_or_else(|| {
            ConfigError::BadRole("missing aggregator section".into())
        })?;
        match section.role.as_str() {
            "primary" => Ok(Role::Primary),
            "backup" => Ok(Role::Backup),
            other => Err(ConfigError::BadRole(other.to_string())),
        }
    }

    /// Authorized operator keys; empty set refuses to start (exit code 2).
    pub fn authorized_keys(&self) -> Result<Vec<VerifyingKey>, ConfigError> {
        let section = self.aggregator.as_ref().ok_or(ConfigError::MissingAuthorizedKeys)?;
        if section.authorized_keys.is_empty() {
            return Err(ConfigError::MissingAuthorizedKeys);
        }
        section.authorized_keys.iter().map(|h| parse_verifying_key(h)).collect()
    }
}

fn q31_checked(v: f64) -> Result<Q31, ConfigError> {
    if !(-1.0..1.0).contains(&v) {
        return Err(ConfigError::OutOfRange(v));
    }
    Ok(Q31::from_f64(v))
}

/// Parse a 32-byte hex Ed25519 public key.
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, ConfigError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ConfigError::BadKey(format!("public key hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConfigError::BadKey("public key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| ConfigError::BadKey(format!("public key rejected: {e}")))
}

/// Parse a 32-byte hex Ed25519 secret key.
pub fn parse_signing_key(hex_key: &str) -> Result<SigningKey, ConfigError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ConfigError::BadKey(format!("secret key hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ConfigError::BadKey("secret key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&arr))
}

// ============================================================================
// Tests
// ============================================================================
