use async_trait::async_trait;
use log::{debug, info, warn};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::counters::CounterSet;
use crate::error::LimitometerError;
use crate::http::compute_backoff;

/// Metric name the counters are published under.
pub const REQUEST_REMAINING: &str = "requestRemaining";

const MAX_RETRIES: u32 = 3;
const SINK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{backend} request failed: {source}")]
    Transport {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{backend} rejected write with status {status}: {body}")]
    Rejected {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid {backend} url {url:?}")]
    InvalidUrl { backend: &'static str, url: String },

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

/// Destination for the counters of a pipeline run.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, metric: &str, counters: &CounterSet) -> Result<(), SinkError>;
}

/// Backend selected with `--output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    InfluxDb,
    PushGateway,
}

impl FromStr for Output {
    type Err = LimitometerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "influxdb" => Ok(Self::InfluxDb),
            "pushgateway" => Ok(Self::PushGateway),
            _ => Err(LimitometerError::Selection {
                flag: "output",
                value: s.to_string(),
            }),
        }
    }
}

impl Output {
    /// Build the sink from its environment configuration. `node` labels
    /// every published series.
    pub fn build(self, node: &str) -> Result<Sink, SinkError> {
        let client = Client::builder()
            .timeout(SINK_TIMEOUT)
            .use_rustls_tls()
            .build()
            .map_err(SinkError::Client)?;
        Ok(match self {
            Self::InfluxDb => Sink::InfluxDb(InfluxSink::from_env(client, node)?),
            Self::PushGateway => Sink::PushGateway(PushGatewaySink::from_env(client, node)?),
        })
    }
}

pub enum Sink {
    InfluxDb(InfluxSink),
    PushGateway(PushGatewaySink),
}

#[async_trait]
impl MetricsSink for Sink {
    async fn publish(&self, metric: &str, counters: &CounterSet) -> Result<(), SinkError> {
        match self {
            Self::InfluxDb(s) => s.publish(metric, counters).await,
            Self::PushGateway(s) => s.publish(metric, counters).await,
        }
    }
}

fn parse_url(backend: &'static str, raw: &str) -> Result<Url, SinkError> {
    let mut raw = raw.to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|_| SinkError::InvalidUrl { backend, url: raw })
}

// Retry on 429/5xx and transport errors.
async fn send_with_retry<F>(backend: &'static str, mut request: F) -> Result<(), SinkError>
where
    F: FnMut() -> RequestBuilder + Send,
{
    let mut attempt: u32 = 0;
    loop {
        let res = match request().send().await {
            Ok(r) => r,
            Err(e) => {
                if attempt < MAX_RETRIES {
                    warn!("{} write error sending request: {}", backend, e);
                    tokio::time::sleep(compute_backoff(attempt, None)).await;
                    attempt += 1;
                    continue;
                }
                return Err(SinkError::Transport { backend, source: e });
            }
        };

        let status = res.status();
        if status.is_success() {
            return Ok(());
        }
        if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
            && attempt < MAX_RETRIES
        {
            let retry_after = res
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let backoff = compute_backoff(attempt, retry_after);
            warn!(
                "{} write retrying (status {}), backoff {:?}",
                backend, status, backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
            continue;
        }
        let body = res.text().await.unwrap_or_default();
        return Err(SinkError::Rejected {
            backend,
            status: status.as_u16(),
            body,
        });
    }
}

/// Writes one line-protocol point per run to an InfluxDB 1.x `/write` endpoint.
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    credentials: Option<(String, String)>,
    node: String,
}

impl InfluxSink {
    pub fn new(
        client: Client,
        base_url: &str,
        database: &str,
        credentials: Option<(String, String)>,
        node: &str,
    ) -> Result<Self, SinkError> {
        let mut write_url = parse_url("influxdb", base_url)?
            .join("write")
            .map_err(|_| SinkError::InvalidUrl {
                backend: "influxdb",
                url: base_url.to_string(),
            })?;
        write_url
            .query_pairs_mut()
            .append_pair("db", database)
            .append_pair("precision", "s");
        Ok(Self {
            client,
            write_url,
            credentials,
            node: node.to_string(),
        })
    }

    /// Env vars:
    /// - INFLUXDB_URL (default: http://localhost:8086)
    /// - INFLUXDB_DATABASE (default: limitometer)
    /// - INFLUXDB_USERNAME / INFLUXDB_PASSWORD (optional basic auth)
    pub fn from_env(client: Client, node: &str) -> Result<Self, SinkError> {
        let url = env::var("INFLUXDB_URL").unwrap_or_else(|_| "http://localhost:8086".into());
        let database = env::var("INFLUXDB_DATABASE").unwrap_or_else(|_| "limitometer".into());
        let credentials = match (env::var("INFLUXDB_USERNAME"), env::var("INFLUXDB_PASSWORD")) {
            (Ok(user), Ok(pass)) => Some((user, pass)),
            (Ok(user), Err(_)) => Some((user, String::new())),
            _ => None,
        };
        Self::new(client, &url, &database, credentials, node)
    }

    /// `None` when there is nothing to write; a point needs at least one field.
    pub fn line(&self, metric: &str, counters: &CounterSet, timestamp: i64) -> Option<String> {
        if counters.is_empty() {
            return None;
        }
        let fields = counters
            .counters()
            .map(|c| format!("{}={}i", escape_key(&c.name), c.remaining))
            .collect::<Vec<_>>()
            .join(",");
        let mut line = escape_measurement(metric);
        if !self.node.is_empty() {
            line.push_str(",node=");
            line.push_str(&escape_key(&self.node));
        }
        Some(format!("{} {} {}", line, fields, timestamp))
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn publish(&self, metric: &str, counters: &CounterSet) -> Result<(), SinkError> {
        let Some(body) = self.line(metric, counters, chrono::Utc::now().timestamp()) else {
            info!("No counters collected, skipping InfluxDB write");
            return Ok(());
        };
        debug!("InfluxDB write: {}", body);
        send_with_retry("influxdb", || {
            let req = self
                .client
                .post(self.write_url.clone())
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(body.clone());
            match &self.credentials {
                Some((user, pass)) => req.basic_auth(user, Some(pass)),
                None => req,
            }
        })
        .await?;
        info!("Wrote {} counters to InfluxDB", counters.len());
        Ok(())
    }
}

/// Replaces the metric group `job/<job>/node/<node>` on a Prometheus push gateway.
pub struct PushGatewaySink {
    client: Client,
    group_url: Url,
}

impl PushGatewaySink {
    pub fn new(client: Client, base_url: &str, job: &str, node: &str) -> Result<Self, SinkError> {
        let mut path = format!("metrics/job/{}", urlencoding::encode(job));
        if !node.is_empty() {
            path.push_str(&format!("/node/{}", urlencoding::encode(node)));
        }
        let group_url = parse_url("pushgateway", base_url)?
            .join(&path)
            .map_err(|_| SinkError::InvalidUrl {
                backend: "pushgateway",
                url: base_url.to_string(),
            })?;
        Ok(Self { client, group_url })
    }

    /// Env vars:
    /// - PUSHGATEWAY_URL (default: http://localhost:9091)
    /// - PUSHGATEWAY_JOB (default: limitometer)
    pub fn from_env(client: Client, node: &str) -> Result<Self, SinkError> {
        let url = env::var("PUSHGATEWAY_URL").unwrap_or_else(|_| "http://localhost:9091".into());
        let job = env::var("PUSHGATEWAY_JOB").unwrap_or_else(|_| "limitometer".into());
        Self::new(client, &url, &job, node)
    }

    /// Text exposition of the counters as one gauge family labelled by category.
    pub fn exposition(metric: &str, counters: &CounterSet) -> Result<String, SinkError> {
        let registry = Registry::new();
        let gauge = IntGaugeVec::new(
            Opts::new(
                exposition_name(metric),
                "Remaining Azure Resource Manager requests before throttling",
            ),
            &["category"],
        )?;
        registry.register(Box::new(gauge.clone()))?;
        for c in counters.counters() {
            gauge
                .with_label_values(&[c.name.as_str()])
                .set(i64::try_from(c.remaining).unwrap_or(i64::MAX));
        }
        let mut buf = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// `requestRemaining` -> `request_remaining`; anything outside
/// `[a-zA-Z0-9_:]` becomes `_`.
pub fn exposition_name(metric: &str) -> String {
    let mut out = String::with_capacity(metric.len() + 4);
    for (i, c) in metric.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[async_trait]
impl MetricsSink for PushGatewaySink {
    async fn publish(&self, metric: &str, counters: &CounterSet) -> Result<(), SinkError> {
        let body = Self::exposition(metric, counters)?;
        debug!("Push gateway payload:\n{}", body);
        send_with_retry("pushgateway", || {
            self.client
                .put(self.group_url.clone())
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(body.clone())
        })
        .await?;
        info!("Pushed {} counters to {}", counters.len(), self.group_url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(pairs: &[(&str, u64)]) -> CounterSet {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn output_selection_is_case_insensitive() {
        assert_eq!("InfluxDB".parse::<Output>().unwrap(), Output::InfluxDb);
        assert_eq!("PUSHGATEWAY".parse::<Output>().unwrap(), Output::PushGateway);
        assert!(matches!(
            "graphite".parse::<Output>(),
            Err(LimitometerError::Selection { flag: "output", .. })
        ));
    }

    #[test]
    fn exposition_names() {
        assert_eq!(exposition_name(REQUEST_REMAINING), "request_remaining");
        assert_eq!(exposition_name("already_snake"), "already_snake");
        assert_eq!(exposition_name("9lives.x"), "_9lives_x");
    }

    #[test]
    fn influx_line_protocol() {
        let sink = InfluxSink::new(Client::new(), "http://influx:8086", "db", None, "node 0").unwrap();
        let line = sink
            .line(
                REQUEST_REMAINING,
                &counters(&[("Microsoft.Compute/LowCostGet3Min", 3989), ("SubIDReads", 11535)]),
                1_700_000_000,
            )
            .unwrap();
        assert_eq!(
            line,
            "requestRemaining,node=node\\ 0 Microsoft.Compute/LowCostGet3Min=3989i,SubIDReads=11535i 1700000000"
        );
        assert!(sink.line(REQUEST_REMAINING, &CounterSet::new(), 0).is_none());
        assert_eq!(
            sink.write_url.as_str(),
            "http://influx:8086/write?db=db&precision=s"
        );
    }

    #[test]
    fn push_gateway_exposition_and_group() {
        let body = PushGatewaySink::exposition(REQUEST_REMAINING, &counters(&[("X", 10)])).unwrap();
        assert!(body.contains("# TYPE request_remaining gauge"));
        assert!(body.contains("request_remaining{category=\"X\"} 10"));

        let sink = PushGatewaySink::new(Client::new(), "http://pgw:9091", "limitometer", "node-0").unwrap();
        assert_eq!(
            sink.group_url.as_str(),
            "http://pgw:9091/metrics/job/limitometer/node/node-0"
        );
    }
}
