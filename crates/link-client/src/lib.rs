// Resilient publish/subscribe link.
//
// One process keeps a single logical connection to a broker, publishes sequenced,
// timestamped telemetry on fixed schedules, consumes a peer's telemetry and reports
// liveness and throughput while the network comes and goes.
//
// Ownership is explicit: the runtime builds one `ConnectionManager`, one
// `CounterRegistry`, one `InflightSet` and at most one `MessageBuffer`, and hands
// shared references to the tasks that need them. Only the manager writes the
// connection state.
pub mod client;
pub mod config;
pub mod counters;
pub mod error;
pub mod runtime;

pub use client::connection::{ConnectionHandle, ConnectionState};
pub use client::liveness::LivenessEvent;
pub use client::stats::StatsSnapshot;
pub use client::subscription::Receipt;
pub use config::{ConfigError, LinkConfig, LinkRole};
pub use error::LinkError;
pub use runtime::LinkRuntime;

#[cfg(test)]
mod tests;
