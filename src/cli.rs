use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::fleet::CONTROL_PLANE_PORT;

#[derive(Parser, Debug)]
#[command(name = "ufleet")]
#[command(about = "Fleet membership and capability-based deployment orchestrator")]
#[command(version)]
pub struct Args {
    /// Fleet identifier embedded in join tokens
    #[arg(long, env = "UFLEET_FLEET_ID", default_value = "default")]
    pub fleet_id: String,

    /// Passphrase the join-token key is derived from
    #[arg(long, env = "UFLEET_FLEET_KEY", hide_env_values = true)]
    pub fleet_key: String,

    /// Path to the JSON settings file
    #[arg(short, long, value_name = "FILE")]
    pub settings_file: Option<PathBuf>,

    /// Bind address for the control plane API
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Control plane API port
    #[arg(short, long, value_name = "PORT", default_value_t = CONTROL_PLANE_PORT)]
    pub port: u16,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to a .env file for loading secrets
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["ufleet", "--fleet-key", "secret"]);
        assert_eq!(args.fleet_id, "default");
        assert_eq!(args.port, CONTROL_PLANE_PORT);
        assert_eq!(args.verbose, 0);
        assert!(args.settings_file.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = Args::parse_from([
            "ufleet",
            "--fleet-key",
            "secret",
            "--fleet-id",
            "prod",
            "-p",
            "9090",
            "-vv",
        ]);
        assert_eq!(args.fleet_id, "prod");
        assert_eq!(args.port, 9090);
        assert_eq!(args.verbose, 2);
    }
}
