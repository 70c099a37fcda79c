use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "socks5-balancer", version, about)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve: relay listener, health checks, and the state monitor
    Run(RunArgs),
    /// Validate a config file and print the normalized JSON
    Check(CheckArgs),
    /// Print version information
    Version,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    pub config: String,
}

#[derive(Debug, clap::Args)]
pub struct CheckArgs {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    pub config: String,
}

/// `check` subcommand body: returns the process exit code.
pub fn check(path: &str) -> i32 {
    match s5b_config::Config::load(path) {
        Ok(cfg) => {
            match serde_json::to_string_pretty(&cfg) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("serialize: {e}");
                    return 1;
                }
            }
            0
        }
        Err(e) => {
            eprintln!("config error: {e}");
            1
        }
    }
}
