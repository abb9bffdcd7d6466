//! Command-line front-end (§2, §6 expansion): resolves configuration,
//! installs logging, and either starts the pool or dumps the effective
//! configuration for deploy-time verification.
//!
//! Grounded on the `Cli`/`Commands` derive split of `airssys-wasm-cli`'s
//! `main.rs`.

// Layer 1: Standard library imports
use std::path::PathBuf;

// Layer 2: Third-party crate imports
use clap::{Parser, Subcommand};

// Layer 3: Internal module imports
// (none — `Cli` is consumed by the binary crate, which wires it to `config`,
// `logging`, and `master`)

#[derive(Debug, Parser)]
#[command(name = "foreman", version, about = "Worker-pool supervisor for queue-backed background jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the master and supervise workers until a shutdown signal.
    Start(StartArgs),
    /// Resolve and print the effective configuration without starting anything.
    Dump(DumpArgs),
}

#[derive(Debug, Parser)]
pub struct StartArgs {
    /// Path to the configuration file (default: `./foreman.yml`, or
    /// `FOREMAN_CONFIG` if set).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Environment name used to resolve environment-table entries (default:
    /// `RACK_ENV`/`RAILS_ENV`/`RESQUE_ENV`).
    #[arg(long)]
    pub environment: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Write the master's pid to this file after startup.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Detach from the controlling terminal and run in the background.
    #[arg(long)]
    pub daemon: bool,
}

#[derive(Debug, Parser)]
pub struct DumpArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub environment: Option<String>,
}

impl StartArgs {
    /// Resolve the configuration path per §6's precedence: `--config`, then
    /// `FOREMAN_CONFIG`, then the default `./foreman.yml`.
    pub fn resolved_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_deref())
    }
}

impl DumpArgs {
    pub fn resolved_config_path(&self) -> PathBuf {
        resolve_config_path(self.config.as_deref())
    }
}

fn resolve_config_path(explicit: Option<&std::path::Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(from_env) = std::env::var("FOREMAN_CONFIG") {
        return PathBuf::from(from_env);
    }
    crate::config::FileConfigLoader::default_path()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code: unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn explicit_config_flag_wins_over_everything() {
        std::env::remove_var("FOREMAN_CONFIG");
        let path = resolve_config_path(Some(std::path::Path::new("/tmp/explicit.yml")));
        assert_eq!(path, PathBuf::from("/tmp/explicit.yml"));
    }

    #[test]
    fn default_path_is_used_absent_flag_and_env() {
        std::env::remove_var("FOREMAN_CONFIG");
        let path = resolve_config_path(None);
        assert_eq!(path, PathBuf::from("./foreman.yml"));
    }
}
