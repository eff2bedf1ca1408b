use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::config::{BrokerBackendType, StoreBackendType};
use super::constants::{
    ENV_BROKER_BACKEND, ENV_BROKER_REDIS_URL, ENV_CONFIG, ENV_HOST, ENV_JWT_SECRET, ENV_PORT,
    ENV_STORE_BACKEND, ENV_STORE_PATH,
};

#[derive(Parser)]
#[command(name = "apix")]
#[command(version, about = "Multi-tenant realtime event bus", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = ENV_PORT)]
    pub port: Option<u16>,

    /// Disable authentication (for development)
    #[arg(long, global = true)]
    pub no_auth: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Stream broker backend (memory or redis)
    #[arg(long, global = true, env = ENV_BROKER_BACKEND, value_parser = parse_broker_backend)]
    pub broker_backend: Option<BrokerBackendType>,

    /// Redis URL for the broker backend
    #[arg(long, global = true, env = ENV_BROKER_REDIS_URL)]
    pub broker_redis_url: Option<String>,

    /// Metadata store backend (memory or sqlite)
    #[arg(long, global = true, env = ENV_STORE_BACKEND, value_parser = parse_store_backend)]
    pub store_backend: Option<StoreBackendType>,

    /// Path to the SQLite database file
    #[arg(long, global = true, env = ENV_STORE_PATH)]
    pub store_path: Option<PathBuf>,

    /// JWT signing secret (prefer the environment variable over the flag)
    #[arg(long, global = true, env = ENV_JWT_SECRET, hide_env_values = true)]
    pub jwt_secret: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the event bus server (default)
    Start,
}

/// CLI values relevant to configuration loading
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub no_auth: bool,
    pub config: Option<PathBuf>,
    pub broker_backend: Option<BrokerBackendType>,
    pub broker_redis_url: Option<String>,
    pub store_backend: Option<StoreBackendType>,
    pub store_path: Option<PathBuf>,
    pub jwt_secret: Option<String>,
}

/// Parse the command line into config overrides and the selected command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        no_auth: cli.no_auth,
        config: cli.config,
        broker_backend: cli.broker_backend,
        broker_redis_url: cli.broker_redis_url,
        store_backend: cli.store_backend,
        store_path: cli.store_path,
        jwt_secret: cli.jwt_secret,
    };
    (config, cli.command)
}

fn parse_broker_backend(s: &str) -> Result<BrokerBackendType, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(BrokerBackendType::Memory),
        "redis" => Ok(BrokerBackendType::Redis),
        other => Err(format!("invalid broker backend '{other}' (memory|redis)")),
    }
}

fn parse_store_backend(s: &str) -> Result<StoreBackendType, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(StoreBackendType::Memory),
        "sqlite" => Ok(StoreBackendType::Sqlite),
        other => Err(format!("invalid store backend '{other}' (memory|sqlite)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backends() {
        assert_eq!(
            parse_broker_backend("Redis").unwrap(),
            BrokerBackendType::Redis
        );
        assert!(parse_broker_backend("kafka").is_err());
        assert_eq!(
            parse_store_backend("sqlite").unwrap(),
            StoreBackendType::Sqlite
        );
        assert!(parse_store_backend("postgres").is_err());
    }

    #[test]
    fn test_cli_verifies() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
