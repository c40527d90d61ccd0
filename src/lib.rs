//! Collects the remaining-request counters Azure Resource Manager reports
//! in its response headers and forwards them to a metrics backend.
//!
//! One run issues a fixed battery of read calls ([`probe::ProbeBattery`]),
//! extracts the rate-limit headers of each response ([`headers`]), merges
//! them ([`counters::aggregate`]) and publishes the result through a
//! [`sink::MetricsSink`]. [`scheduler`] runs this once or on an interval.

pub mod auth;
pub mod cli;
pub mod config;
pub mod counters;
pub mod error;
pub mod headers;
pub mod http;
pub mod probe;
pub mod scheduler;
pub mod sink;

use log::info;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authorizer;
use crate::cli::CliOptions;
use crate::config::{Config, ConfigError, ConfigSource};
use crate::error::Result;
use crate::http::ArmClient;
use crate::probe::ProbeBattery;
use crate::scheduler::{Mode, Pipeline};
use crate::sink::Output;

/// Resolve configuration, build the client and sink, then hand over to the
/// scheduler. Flag selections are validated before anything touches the network.
pub async fn start(opts: &CliOptions) -> Result<()> {
    let output: Output = opts.output.parse()?;
    let mode = Mode::from_flags(&opts.mode, opts.poll_interval)?;
    let source: ConfigSource = opts.config.parse()?;

    let cfg = Config::load(source).await?;
    let node = match opts.node.clone() {
        Some(n) => n,
        None if !cfg.vm_name.is_empty() => cfg.vm_name.clone(),
        None => return Err(ConfigError::Missing("NODE_NAME").into()),
    };

    let client = ArmClient::new(&cfg, Authorizer::from_env(&cfg))?;
    let sink = output.build(&node)?;
    let battery = ProbeBattery::standard(Duration::from_secs(opts.probe_timeout));

    info!("Starting limitometer with {} as target VM", node);
    let pipeline = Pipeline::new(Arc::new(client), battery, Arc::new(sink), node);
    scheduler::run(pipeline, mode).await
}
