//! Broker configuration, including the plugin-style argv it accepts.

use crate::errors::BrokerError;
use crate::regions::parse_int_str;
use log::warn;
use std::path::PathBuf;

/// Listening address, connection budget and region manifest for a broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// `addr:port` to listen on.
    pub host: String,
    /// Completed connections to serve before ceasing operation; 0 means no
    /// limit.
    pub max_connections: u32,
    /// Optional path to a region manifest (see [`crate::regions`]).
    pub regions_manifest: Option<PathBuf>,
    /// Coalesce memory accesses that land on the same instruction into a
    /// single range-spanning descriptor. This over-reports the touched range
    /// when an instruction performs disjoint accesses, but keeps one
    /// descriptor per instruction, which is what the load/store-unit model
    /// expects.
    pub merge_mem_accesses: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost:9487".to_owned(),
            max_connections: 1,
            regions_manifest: None,
            merge_mem_accesses: true,
        }
    }
}

impl BrokerConfig {
    /// Parse the plugin-style argument vector:
    /// `-host=ADDR:PORT`, `-max-accepted-connection=N`,
    /// `-binary-regions=PATH`. Unknown arguments are ignored, matching how
    /// hosts pass a shared argv to several plugins.
    pub fn from_plugin_args<I, S>(args: I) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = BrokerConfig::default();
        for arg in args {
            let arg = arg.as_ref();
            if let Some(value) = arg.strip_prefix("-host=") {
                if value.contains(':') {
                    config.host = value.to_owned();
                } else {
                    warn!("ignoring -host value without a port: {value}");
                }
            } else if let Some(value) = arg.strip_prefix("-max-accepted-connection=") {
                let n = parse_int_str(value)
                    .filter(|n| *n >= 0 && *n <= i64::from(u32::MAX))
                    .ok_or_else(|| BrokerError::Config(format!("invalid number: {value}")))?;
                config.max_connections = n as u32;
            } else if let Some(value) = arg.strip_prefix("-binary-regions=") {
                config.regions_manifest = Some(PathBuf::from(value));
            }
        }
        Ok(config)
    }
}
