use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::sink::SinkError;

/// Conditions that abort a pipeline run or the whole process.
///
/// Transient probe failures are not represented here; they are absorbed by
/// the probe set (see [`ControlPlaneError`]) and only surface as skipped probes.
#[derive(Debug, Error)]
pub enum LimitometerError {
    #[error("probe {probe} returned status {status}, refusing to publish counters")]
    UntrustedResponse { probe: &'static str, status: u16 },

    #[error("malformed rate-limit counter in {header}: {value:?}")]
    MalformedCounter { header: &'static str, value: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("unsupported value {value:?} for --{flag}")]
    Selection { flag: &'static str, value: String },

    #[error("polling worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// Failure of a single control-plane call. Always transient: the probe is
/// skipped and the battery continues.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid request url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unresolved dependency: {0}")]
    Unresolved(String),
}

pub type Result<T> = std::result::Result<T, LimitometerError>;
