//! Environment-backed configuration for the zerog binary.
//!
//! The library itself takes broker coordinates at construction; only the
//! binary entry points read the environment.

use anyhow::{Context, Result};

/// Runtime configuration shared by the server and worker entry points.
#[derive(Debug, Clone)]
pub struct Config {
    /// Service name; the job tube is named `{service_name}_jobs`.
    pub service_name: String,
    /// Hostname or address reported in worker ids.
    pub host: String,
    /// Broker host.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
}

impl Config {
    /// Load configuration from the environment (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let service_name =
            std::env::var("ZEROG_SERVICE").context("ZEROG_SERVICE must be set")?;
        let host = std::env::var("ZEROG_HOST").unwrap_or_else(|_| "localhost".to_string());
        let broker_host =
            std::env::var("ZEROG_BROKER_HOST").unwrap_or_else(|_| "localhost".to_string());
        let broker_port = std::env::var("ZEROG_BROKER_PORT")
            .unwrap_or_else(|_| "11300".to_string())
            .parse()
            .context("ZEROG_BROKER_PORT must be a port number")?;

        Ok(Self {
            service_name,
            host,
            broker_host,
            broker_port,
        })
    }

    /// Name of the tube workers lease jobs from.
    pub fn jobs_tube(&self) -> String {
        format!("{}_jobs", self.service_name)
    }
}
