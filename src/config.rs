//! Startup configuration: the main config file and the timings table.
//!
//! Both files use a flat `key = value` format with `#` comments. Timing
//! values are the fixed durations every node in a cluster must agree on, so
//! a missing or malformed key is a fatal startup error rather than a default.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::peers::{PeerId, PeerIdError};

/// Fatal configuration problems; the daemon refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("cannot read {path}: {detail}")]
    Io { path: String, detail: String },

    /// A line did not parse as `key = value`.
    #[error("{path}:{line_no}: expected `key = value`, found {line:?}")]
    Syntax { path: String, line_no: usize, line: String },

    /// A required timing key was missing or not an integer.
    #[error("timing value {key} is missing or not an integer number of milliseconds")]
    Timing { key: String },

    /// A recognised option had an unusable value.
    #[error("option {key} has invalid value {value:?}")]
    BadValue { key: String, value: String },

    /// A peer entry did not parse as `host:port`.
    #[error("invalid peer entry: {0}")]
    BadPeer(#[from] PeerIdError),
}

/// Parsed contents of the main configuration file.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_address: String,
    pub listen_port: u16,
    pub peers: Vec<PeerId>,
    pub verbosity: u8,
    pub adapter_config: Option<String>,
    pub logger_config: Option<String>,
    pub timings_config: Option<String>,
    /// Module-private options, keyed by their dotted name (`lb.invariant`).
    pub module_options: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 1870,
            peers: Vec::new(),
            verbosity: 5,
            adapter_config: None,
            logger_config: None,
            timings_config: None,
            module_options: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads a configuration file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for (key, value) in read_pairs(path)? {
            match key.as_str() {
                "listen_address" => config.listen_address = value,
                "listen_port" => {
                    config.listen_port = value.parse().map_err(|_| ConfigError::BadValue {
                        key,
                        value: value.clone(),
                    })?;
                }
                "peers" => {
                    // The peers option may be given once with a comma list or
                    // repeated, one peer per line.
                    for entry in value.split(',') {
                        let entry = entry.trim();
                        if !entry.is_empty() {
                            config.peers.push(PeerId::parse(entry)?);
                        }
                    }
                }
                "verbosity" => {
                    let level: u8 = value.parse().map_err(|_| ConfigError::BadValue {
                        key: key.clone(),
                        value: value.clone(),
                    })?;
                    if level > 8 {
                        return Err(ConfigError::BadValue { key, value });
                    }
                    config.verbosity = level;
                }
                "adapter_config" => config.adapter_config = Some(value),
                "logger_config" => config.logger_config = Some(value),
                "timings_config" => config.timings_config = Some(value),
                _ if key.contains('.') => {
                    config.module_options.insert(key, value);
                }
                _ => {
                    log::warn!("ignoring unrecognised configuration option {}", key);
                }
            }
        }
        Ok(config)
    }

    /// The identity of this node, derived from the listening endpoint.
    pub fn local_id(&self) -> PeerId {
        PeerId::from_host_port(&self.listen_address, self.listen_port)
    }
}

macro_rules! timings {
    ($($field:ident),+ $(,)?) => {
        /// The fixed durations (milliseconds) shared by every node.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[allow(non_snake_case)]
        pub struct Timings {
            $(pub $field: u64,)+
        }

        impl Timings {
            /// Loads the timings file; every key must be present and integer.
            pub fn load(path: &Path) -> Result<Self, ConfigError> {
                let pairs: BTreeMap<String, String> =
                    read_pairs(path)?.into_iter().collect();
                Ok(Self {
                    $($field: pairs
                        .get(stringify!($field))
                        .and_then(|raw| raw.parse().ok())
                        .ok_or_else(|| ConfigError::Timing {
                            key: stringify!($field).to_string(),
                        })?,)+
                })
            }
        }
    };
}

timings! {
    GM_PHASE_TIME,
    SC_PHASE_TIME,
    LB_PHASE_TIME,
    CSRC_RESEND_TIME,
    CSRC_DEFAULT_TIMEOUT,
    CSUC_RESEND_TIME,
    CS_EXCHANGE_TIME,
    GM_AYC_RESPONSE_TIMEOUT,
    GM_AYT_RESPONSE_TIMEOUT,
    GM_CHECK_TIMEOUT,
    GM_FID_TIMEOUT,
    GM_GLOBAL_TIMEOUT,
    GM_INVITE_RESPONSE_TIMEOUT,
    GM_PREMERGE_GRANULARITY,
    GM_PREMERGE_MAX_TIMEOUT,
    GM_PREMERGE_MIN_TIMEOUT,
    GM_TIMEOUT_TIMEOUT,
    LB_REQUEST_TIMEOUT,
    LB_ROUND_TIME,
}

impl Timings {
    /// Fixed values suitable for tests and local experiments.
    pub fn for_tests() -> Self {
        Self {
            GM_PHASE_TIME: 200,
            SC_PHASE_TIME: 150,
            LB_PHASE_TIME: 200,
            CSRC_RESEND_TIME: 10,
            CSRC_DEFAULT_TIMEOUT: 2_000,
            CSUC_RESEND_TIME: 10,
            CS_EXCHANGE_TIME: 10_000,
            GM_AYC_RESPONSE_TIMEOUT: 100,
            GM_AYT_RESPONSE_TIMEOUT: 100,
            GM_CHECK_TIMEOUT: 100,
            GM_FID_TIMEOUT: 100,
            GM_GLOBAL_TIMEOUT: 100,
            GM_INVITE_RESPONSE_TIMEOUT: 100,
            GM_PREMERGE_GRANULARITY: 10,
            GM_PREMERGE_MAX_TIMEOUT: 200,
            GM_PREMERGE_MIN_TIMEOUT: 50,
            GM_TIMEOUT_TIMEOUT: 100,
            LB_REQUEST_TIMEOUT: 100,
            LB_ROUND_TIME: 200,
        }
    }
}

/// Reads a `key = value` file into ordered pairs. Repeated keys are kept.
fn read_pairs(path: &Path) -> Result<Vec<(String, String)>, ConfigError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: display.clone(),
        detail: e.to_string(),
    })?;

    let mut pairs = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Syntax {
            path: display.clone(),
            line_no: index + 1,
            line: line.to_string(),
        })?;
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}
