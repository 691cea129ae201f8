//! `casual` — the peripheral administration CLI binary. Parses a
//! `<noun> <verb>` command line, hands it to [`casual_core::cli::run`],
//! and prints whatever one-line result comes back. All protocol logic
//! lives in the library; this binary is just the process entry point.

use anyhow::Result;
use casual_core::cli::{self, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let home = cli.resolve_domain_home()?;
    let _log_guard = casual_core::logging::init("cli", &home.join("log"))?;

    match cli::run(&cli).await {
        Ok(message) => {
            println!("{message}");
            Ok(())
        }
        Err(e) => {
            eprintln!("casual: {e}");
            std::process::exit(1);
        }
    }
}
