use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

use orbit_gateway::dispatcher::DEFAULT_CHANGE_BUFFER;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

/// Server settings, read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    /// Capacity of the change broadcast channel.
    pub change_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = var("ORBIT_JWT_SECRET").unwrap_or_else(|| {
            warn!("ORBIT_JWT_SECRET not set, using the development secret");
            DEV_JWT_SECRET.into()
        });
        let db_path = PathBuf::from(var("ORBIT_DB_PATH").unwrap_or_else(|| "orbit.db".into()));
        let host = var("ORBIT_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("ORBIT_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("ORBIT_PORT must be a port number")?;
        let change_buffer = match var("ORBIT_CHANGE_BUFFER") {
            Some(raw) => raw.parse().context("ORBIT_CHANGE_BUFFER must be a positive integer")?,
            None => DEFAULT_CHANGE_BUFFER,
        };

        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            change_buffer,
        })
    }
}
