// Binaries for both sides of the telemetry link.
pub mod app;
pub mod demo;
pub mod observability;
