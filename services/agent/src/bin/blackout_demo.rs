// Agent and backend over an in-process broker through a scripted blackout.
use agent::demo::{DemoArgs, run_blackout};
use agent::observability;
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = DemoArgs::parse();
    observability::init_observability("blackout-demo", false)?;
    let report = run_blackout(&args).await?;
    report.log();
    Ok(())
}
