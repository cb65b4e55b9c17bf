// Scripted blackout: both sides over one loopback broker, with the network cut for a
// while in the middle.
use anyhow::{Context, Result};
use clap::Parser;
use link_client::config::{LinkConfig, LinkRole};
use link_client::{LinkRuntime, StatsSnapshot};
use link_transport::LoopbackBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "blackout-demo")]
#[command(about = "Run agent and backend in-process through a scripted network blackout")]
pub struct DemoArgs {
    /// Seconds of healthy link before the blackout
    #[arg(long, default_value = "5")]
    pub warmup_secs: u64,

    /// Seconds the broker stays unreachable
    #[arg(long, default_value = "8")]
    pub blackout_secs: u64,

    /// Seconds to keep running after connectivity returns
    #[arg(long, default_value = "12")]
    pub recovery_secs: u64,
}

pub struct DemoReport {
    pub agent: StatsSnapshot,
    pub backend: StatsSnapshot,
    pub connect_attempts: usize,
}

pub async fn run_blackout(args: &DemoArgs) -> Result<DemoReport> {
    let broker = LoopbackBroker::new();
    let agent = LinkRuntime::start(
        LinkConfig::defaults_for(LinkRole::Agent),
        Arc::new(broker.transport("agent")),
    )
    .await
    .context("start agent link")?;
    let backend = LinkRuntime::start(
        LinkConfig::defaults_for(LinkRole::Backend),
        Arc::new(broker.transport("backend")),
    )
    .await
    .context("start backend link")?;

    sleep(Duration::from_secs(args.warmup_secs)).await;
    info!(secs = args.blackout_secs, "blackout begins");
    broker.set_reachable(false);
    sleep(Duration::from_secs(args.blackout_secs)).await;
    broker.set_reachable(true);
    info!("blackout over");
    sleep(Duration::from_secs(args.recovery_secs)).await;

    let agent = agent.shutdown().await.context("stop agent link")?;
    let backend = backend.shutdown().await.context("stop backend link")?;
    Ok(DemoReport {
        agent,
        backend,
        connect_attempts: broker.connect_attempts().len(),
    })
}

impl DemoReport {
    pub fn log(&self) {
        for (side, snapshot) in [("agent", &self.agent), ("backend", &self.backend)] {
            let totals = snapshot.totals();
            info!(
                side,
                published = totals.published,
                acknowledged = totals.acknowledged,
                received = totals.received,
                failed = totals.failed,
                dropped = totals.dropped,
                connection = %snapshot.connection,
                "demo summary"
            );
        }
        info!(attempts = self.connect_attempts, "broker connect attempts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link_client::ConnectionState;

    #[tokio::test(start_paused = true)]
    async fn both_sides_recover_after_blackout() -> Result<()> {
        let args = DemoArgs {
            warmup_secs: 3,
            blackout_secs: 4,
            recovery_secs: 12,
        };
        let report = run_blackout(&args).await?;
        assert_eq!(report.agent.connection, ConnectionState::Connected);
        assert_eq!(report.backend.connection, ConnectionState::Connected);

        // The agent buffers through the blackout; the backend skips ticks instead.
        let location = report.agent.counters.topic("/driver/location").expect("location");
        assert_eq!(location.dropped, 0);
        assert_eq!(location.acknowledged, location.published);
        assert!(report.backend.counters.topic("/driver/location").expect("rx").received > 10);
        assert!(report.connect_attempts > 2);
        Ok(())
    }
}
