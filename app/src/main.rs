//! socks5-balancer entrypoint.
//! - tracing initialization (env-driven format/level)
//! - `run`: load config, start pool + checker + relay + monitor
//! - `check`: validate a config file and print the normalized form

mod bootstrap;
mod cli;
mod logging;

use clap::Parser;

/// Exit code for a config load/validation failure.
const EXIT_CONFIG: i32 = 1;
/// Exit code for a bind/listen failure at startup.
const EXIT_BIND: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    logging::init()?;

    match args.command {
        cli::Commands::Run(a) => match bootstrap::run(&a.config).await {
            Ok(()) => Ok(()),
            Err(bootstrap::StartError::Config(e)) => {
                eprintln!("config error: {e}");
                std::process::exit(EXIT_CONFIG);
            }
            Err(bootstrap::StartError::Bind { what, source }) => {
                eprintln!("bind {what}: {source}");
                std::process::exit(EXIT_BIND);
            }
        },
        cli::Commands::Check(a) => {
            let code = cli::check(&a.config);
            std::process::exit(code);
        }
        cli::Commands::Version => {
            println!("socks5-balancer {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
