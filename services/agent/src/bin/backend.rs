// Backend: publishes offers and rides, consumes driver locations.
use anyhow::Result;
use link_client::config::LinkRole;

#[tokio::main]
async fn main() -> Result<()> {
    agent::app::main_for(LinkRole::Backend).await
}
