// Driver agent: publishes location, consumes offers and rides.
use anyhow::Result;
use link_client::config::LinkRole;

#[tokio::main]
async fn main() -> Result<()> {
    agent::app::main_for(LinkRole::Agent).await
}
