mod cli;
mod display;
mod error;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, RunCommand};
use log::debug;
use sdmxget::config::Config;

const DEFAULT_LOGGING_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG to `DEFAULT_LOGGING_LEVEL` if not set
    let _ =
        std::env::var("RUST_LOG").map_err(|_| std::env::set_var("RUST_LOG", DEFAULT_LOGGING_LEVEL));
    pretty_env_logger::init_timed();
    let args = Cli::parse();
    debug!("args: {args:?}");
    let config = read_config_from_toml()?;
    debug!("config: {config:?}");

    if let Some(command) = args.command {
        match command.run(config).await {
            Err(err) if err.is_broken_pipe() => {
                debug!("stdout closed early: {err}");
            }
            result => result?,
        }
    }
    Ok(())
}

fn read_config_from_toml() -> Result<Config> {
    // macOS: ~/Library/Application Support/sdmxget/config.toml
    match dirs::config_dir() {
        Some(dir) => read_config(dir.join("sdmxget").join("config.toml")),
        None => Ok(Config::default()),
    }
}

fn read_config<P: AsRef<Path>>(file_path: P) -> Result<Config> {
    let file_path = file_path.as_ref();
    match std::fs::read_to_string(file_path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("Invalid TOML in config file {}", file_path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(e).with_context(|| format!("Error reading config file {}", file_path.display())),
    }
}
