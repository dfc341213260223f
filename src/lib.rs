//! Prometheus exporter for Siemens S7 PLCs.
//!
//! Polls data blocks on one or more S7 controllers over ISO-on-TCP,
//! decodes typed values out of the raw reads, and exposes them as labeled
//! gauges on an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   S7 PLCs       │────>│     Poller      │────>│   HTTP Server   │
//! │  (ISO-on-TCP)   │     │ decode + publish│     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! One poll cycle walks every configured target, block and metric in
//! order, sequentially; failures are isolated per metric and per target.
//! The special metric name `Recepi` is a recipe identifier string and is
//! published as two derived gauges, its alphabet rank and its numeric
//! part.
//!
//! # Usage
//!
//! ```bash
//! s7-exporter-prometheus --config targets.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod decode;
pub mod http;
pub mod poller;
pub mod recipe;
pub mod registry;
pub mod s7;
pub mod transport;

pub use config::ExporterConfig;
pub use http::HttpServer;
pub use poller::{PlcPoller, PollReport};
pub use registry::MetricRegistry;
pub use s7::S7Transport;
