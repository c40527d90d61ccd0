use limitometer::counters::CounterSet;
use limitometer::sink::{InfluxSink, MetricsSink, PushGatewaySink, REQUEST_REMAINING};
use reqwest::Client;

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn should_run_live() -> bool {
    matches!(env_var("LIVE_BACKEND_TESTS").as_deref(), Some("1"))
}

fn sample() -> CounterSet {
    [("X".to_string(), 10u64)].into_iter().collect()
}

#[ignore]
#[tokio::test]
async fn live_influxdb_round_trip() -> anyhow::Result<()> {
    if !should_run_live() {
        eprintln!("skipping live test: LIVE_BACKEND_TESTS!=1");
        return Ok(());
    }
    let url = env_var("INFLUXDB_URL").unwrap_or_else(|| "http://localhost:8086".into());
    let db = env_var("INFLUXDB_DATABASE").unwrap_or_else(|| "limitometer".into());
    let client = Client::new();

    client
        .post(format!("{}/query", url))
        .query(&[("q", format!("CREATE DATABASE \"{}\"", db))])
        .send()
        .await?
        .error_for_status()?;

    let sink = InfluxSink::new(client.clone(), &url, &db, None, "live-node")?;
    sink.publish(REQUEST_REMAINING, &sample()).await?;

    let body: serde_json::Value = client
        .get(format!("{}/query", url))
        .query(&[
            ("db", db.as_str()),
            (
                "q",
                "SELECT last(\"X\") FROM \"requestRemaining\" WHERE \"node\" = 'live-node'",
            ),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let value = &body["results"][0]["series"][0]["values"][0][1];
    assert_eq!(value.as_u64(), Some(10), "query result: {body}");
    Ok(())
}

#[ignore]
#[tokio::test]
async fn live_push_gateway_round_trip() -> anyhow::Result<()> {
    if !should_run_live() {
        eprintln!("skipping live test: LIVE_BACKEND_TESTS!=1");
        return Ok(());
    }
    let url = env_var("PUSHGATEWAY_URL").unwrap_or_else(|| "http://localhost:9091".into());
    let client = Client::new();

    let sink = PushGatewaySink::new(client.clone(), &url, "limitometer-live", "live-node")?;
    sink.publish(REQUEST_REMAINING, &sample()).await?;

    let body = client
        .get(format!("{}/metrics", url))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let line = body
        .lines()
        .find(|l| {
            l.starts_with("request_remaining{")
                && l.contains("job=\"limitometer-live\"")
                && l.contains("category=\"X\"")
        })
        .ok_or_else(|| anyhow::anyhow!("pushed series not found"))?;
    assert!(line.ends_with(" 10"), "series: {line}");

    client
        .delete(format!("{}/metrics/job/limitometer-live/node/live-node", url))
        .send()
        .await?;
    Ok(())
}
