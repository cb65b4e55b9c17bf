// Process glue: load config, wire observability and a transport, run the link until
// shutdown or a fatal loss.
use crate::observability;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use link_client::config::{LinkConfig, LinkRole};
use link_client::{LinkRuntime, StatsSnapshot};
use link_mqtt::{MqttSettings, MqttTransport};
use link_transport::{LoopbackBroker, Transport};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// MQTT 3.1.1 over TCP.
    Mqtt,
    /// In-process broker; nothing leaves the process.
    Loopback,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Resilient telemetry link over MQTT")]
pub struct Args {
    /// YAML config file; falls back to AGENT_CONFIG / BACKEND_CONFIG
    #[arg(long)]
    pub config: Option<String>,

    /// Transport used to reach the broker
    #[arg(long, value_enum, default_value = "mqtt")]
    pub transport: TransportKind,
}

pub fn build_transport(kind: TransportKind, config: &LinkConfig) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Mqtt => Arc::new(MqttTransport::new(MqttSettings::from_config(config))),
        TransportKind::Loopback => {
            Arc::new(LoopbackBroker::new().transport(config.mqtt.client_id.clone()))
        }
    }
}

/// Run one side of the link until `shutdown` resolves. Returns the final snapshot, or an
/// error when the link could not start or was lost with auto-reconnect disabled.
pub async fn run_with_shutdown<F>(role: LinkRole, args: Args, shutdown: F) -> Result<StatsSnapshot>
where
    F: Future<Output = ()> + Send,
{
    let config = LinkConfig::from_env_or_yaml(role, args.config.as_deref())
        .with_context(|| format!("load {} configuration", role.as_str()))?;
    let metrics_handle = observability::init_observability(role.as_str(), config.debug_logging)?;
    let metrics_task = config.metrics_bind.map(|addr| {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, addr).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        })
    });

    let transport = build_transport(args.transport, &config);
    tracing::info!(
        role = role.as_str(),
        transport = ?args.transport,
        host = %config.mqtt.host,
        port = config.mqtt.port,
        "starting link"
    );
    let mut runtime = LinkRuntime::start(config, transport)
        .await
        .context("start link")?;

    let fatal = tokio::select! {
        _ = shutdown => None,
        err = runtime.terminated() => Some(err),
    };
    let snapshot = runtime.shutdown().await.context("shut down link")?;
    if let Some(task) = metrics_task {
        task.abort();
    }
    match fatal {
        Some(err) => Err(err).context("link terminated"),
        None => Ok(snapshot),
    }
}

/// Entry point shared by the agent and backend binaries.
pub async fn main_for(role: LinkRole) -> Result<()> {
    let args = Args::parse();
    run_with_shutdown(role, args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
