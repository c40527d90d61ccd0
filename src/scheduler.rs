use log::{error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{LimitometerError, Result};
use crate::http::ControlPlane;
use crate::probe::{Collection, ProbeBattery};
use crate::sink::{MetricsSink, REQUEST_REMAINING};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Execution mode, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    OneShot,
    Service { interval: Duration },
}

impl Mode {
    /// `mode` is matched case-insensitively; the interval only applies to
    /// service mode and must be at least one second.
    pub fn from_flags(mode: &str, poll_interval_secs: u64) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "oneshot" => Ok(Self::OneShot),
            "service" if poll_interval_secs > 0 => Ok(Self::Service {
                interval: Duration::from_secs(poll_interval_secs),
            }),
            "service" => Err(LimitometerError::Selection {
                flag: "poll-interval",
                value: poll_interval_secs.to_string(),
            }),
            _ => Err(LimitometerError::Selection {
                flag: "mode",
                value: mode.to_string(),
            }),
        }
    }
}

/// Probe, extract, aggregate and publish for one target VM.
pub struct Pipeline {
    client: Arc<dyn ControlPlane>,
    battery: ProbeBattery,
    sink: Arc<dyn MetricsSink>,
    node: String,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        battery: ProbeBattery,
        sink: Arc<dyn MetricsSink>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            client,
            battery,
            sink,
            node: node.into(),
        }
    }

    pub async fn run_once(&self) -> Result<Collection> {
        info!("Querying Azure API for remaining requests");
        let collection = self.battery.collect(self.client.as_ref(), &self.node).await?;
        if !collection.skipped.is_empty() {
            warn!(
                "{} probe(s) contributed no counters: {}",
                collection.skipped.len(),
                collection.skipped.join(", ")
            );
        }
        self.sink
            .publish(REQUEST_REMAINING, &collection.counters)
            .await?;
        Ok(collection)
    }
}

pub async fn run(pipeline: Pipeline, mode: Mode) -> Result<()> {
    match mode {
        Mode::OneShot => {
            info!("Running in oneshot mode, will get remaining requests once and exit afterwards");
            pipeline.run_once().await.map(|_| ())
        }
        Mode::Service { interval } => {
            info!(
                "Running in service mode, will poll Azure API every {} seconds",
                interval.as_secs()
            );
            let shutdown = shutdown_signal();
            run_service(pipeline, interval, shutdown).await
        }
    }
}

/// Repeat the pipeline every `interval` on a background task until
/// `shutdown` resolves. A run in progress when `shutdown` fires is allowed
/// to finish; no new run starts afterwards.
pub async fn run_service<S>(pipeline: Pipeline, interval: Duration, shutdown: S) -> Result<()>
where
    S: Future<Output = ()>,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let mut worker = tokio::spawn(async move {
        loop {
            pipeline.run_once().await?;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => break,
            }
        }
        Ok::<(), LimitometerError>(())
    });

    tokio::select! {
        _ = shutdown => {}
        res = &mut worker => {
            let res = join_worker(res);
            if let Err(e) = &res {
                error!("Polling stopped: {}", e);
            }
            return res;
        }
    }

    info!("Received signal to stop. Shutting down.");
    let _ = stop_tx.send(true);
    join_worker(worker.await)
}

fn join_worker(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| LimitometerError::Worker(e.to_string()))?
}

/// Resolves on SIGINT or SIGTERM. The handlers are installed before this
/// returns, so a signal arriving before the first poll is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());
    async move {
        let (mut interrupt, mut terminate) = match (interrupt, terminate) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags() {
        assert_eq!(Mode::from_flags("OneShot", 0).unwrap(), Mode::OneShot);
        assert_eq!(
            Mode::from_flags("service", DEFAULT_POLL_INTERVAL_SECS).unwrap(),
            Mode::Service {
                interval: Duration::from_secs(60)
            }
        );
        assert!(matches!(
            Mode::from_flags("service", 0),
            Err(LimitometerError::Selection { flag: "poll-interval", .. })
        ));
        assert!(matches!(
            Mode::from_flags("daemon", 60),
            Err(LimitometerError::Selection { flag: "mode", .. })
        ));
    }
}
