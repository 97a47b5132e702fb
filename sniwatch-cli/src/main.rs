use anyhow::{Context, Result};
use sniwatch_cli::{init_tracing, run, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let code = run(cli).await.context("sniwatch failed")?;
    std::process::exit(code);
}
