use crate::config::Config;
use crate::error::QueryError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use std::future::Future;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// One row of a Flux result. `value` stays as text so callers decide how to
/// interpret it.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxRecord {
    pub measurement: String,
    pub field: String,
    pub value: String,
    pub time: Option<DateTime<Utc>>,
}

/// The narrow query contract the pollers and discovery depend on.
pub trait TimeSeriesSource: Send + Sync + 'static {
    /// Latest aggregated sample(s) of one measurement/field.
    fn query(
        &self,
        measurement: &str,
        field: &str,
        window: Duration,
        every: Duration,
    ) -> impl Future<Output = Result<Vec<FluxRecord>, QueryError>> + Send;

    /// Everything currently reporting, unfiltered.
    fn query_all(
        &self,
        window: Duration,
        every: Duration,
    ) -> impl Future<Output = Result<Vec<FluxRecord>, QueryError>> + Send;
}

#[derive(Clone, Debug)]
pub struct InfluxClient {
    http: Client,
    query_url: Url,
    token: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Result<Self> {
        let base = format!(
            "http://{}:{}/api/v2/query",
            config.enpal_host, config.enpal_port
        );
        let query_url = Url::parse_with_params(&base, &[("org", config.influx_org.as_str())])
            .with_context(|| format!("invalid influx url {base}"))?;
        let http = Client::builder()
            .timeout(config.query_timeout())
            .build()
            .context("failed to build influx http client")?;
        Ok(Self {
            http,
            query_url,
            token: config.enpal_token.clone(),
            bucket: config.influx_bucket.clone(),
        })
    }

    async fn run(&self, flux: String) -> Result<Vec<FluxRecord>, QueryError> {
        tracing::trace!(query = %flux, "running flux query");
        let response = self
            .http
            .post(self.query_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "application/vnd.flux")
            .header(ACCEPT, "application/csv")
            .body(flux)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }
        parse_flux_csv(&body)
    }
}

impl TimeSeriesSource for InfluxClient {
    async fn query(
        &self,
        measurement: &str,
        field: &str,
        window: Duration,
        every: Duration,
    ) -> Result<Vec<FluxRecord>, QueryError> {
        self.run(latest_value_query(
            &self.bucket,
            measurement,
            field,
            window,
            every,
        ))
        .await
    }

    async fn query_all(
        &self,
        window: Duration,
        every: Duration,
    ) -> Result<Vec<FluxRecord>, QueryError> {
        self.run(snapshot_query(&self.bucket, window, every)).await
    }
}

pub fn latest_value_query(
    bucket: &str,
    measurement: &str,
    field: &str,
    window: Duration,
    every: Duration,
) -> String {
    format!(
        "from(bucket: \"{bucket}\")\n  \
         |> range(start: -{window})\n  \
         |> filter(fn: (r) => r[\"_measurement\"] == \"{measurement}\")\n  \
         |> filter(fn: (r) => r[\"_field\"] == \"{field}\")\n  \
         |> aggregateWindow(every: {every}, fn: last, createEmpty: false)\n  \
         |> last()\n  \
         |> yield(name: \"last\")",
        bucket = flux_string(bucket),
        window = flux_duration(window),
        measurement = flux_string(measurement),
        field = flux_string(field),
        every = flux_duration(every),
    )
}

pub fn snapshot_query(bucket: &str, window: Duration, every: Duration) -> String {
    format!(
        "from(bucket: \"{bucket}\")\n  \
         |> range(start: -{window})\n  \
         |> aggregateWindow(every: {every}, fn: last, createEmpty: false)\n  \
         |> yield(name: \"last\")",
        bucket = flux_string(bucket),
        window = flux_duration(window),
        every = flux_duration(every),
    )
}

fn flux_duration(duration: Duration) -> String {
    format!("{}s", duration.as_secs().max(1))
}

fn flux_string(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Parses the annotated CSV that `/api/v2/query` returns. Tables with a
/// different schema are separated by blank lines and carry their own header.
pub fn parse_flux_csv(body: &str) -> Result<Vec<FluxRecord>, QueryError> {
    let normalized = body.replace("\r\n", "\n");
    let mut records = Vec::new();
    for block in normalized.split("\n\n") {
        if block.trim().is_empty() {
            continue;
        }
        parse_table(block, &mut records)?;
    }
    Ok(records)
}

fn parse_table(block: &str, out: &mut Vec<FluxRecord>) -> Result<(), QueryError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .flexible(true)
        .from_reader(block.as_bytes());
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|header| header == name);

    if let Some(error_idx) = column("error") {
        for row in reader.records() {
            let row = row?;
            if let Some(message) = row.get(error_idx).filter(|msg| !msg.trim().is_empty()) {
                return Err(QueryError::Flux(message.trim().to_string()));
            }
        }
        return Ok(());
    }

    let (Some(measurement_idx), Some(field_idx), Some(value_idx)) =
        (column("_measurement"), column("_field"), column("_value"))
    else {
        tracing::debug!(headers = ?headers, "skipping flux table without measurement/field/value");
        return Ok(());
    };
    let time_idx = column("_time");

    for row in reader.records() {
        let row = row?;
        let (Some(measurement), Some(field), Some(value)) = (
            row.get(measurement_idx),
            row.get(field_idx),
            row.get(value_idx),
        ) else {
            continue;
        };
        let time = time_idx
            .and_then(|idx| row.get(idx))
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|ts| ts.with_timezone(&Utc));
        out.push(FluxRecord {
            measurement: measurement.to_string(),
            field: field.to_string(),
            value: value.to_string(),
            time,
        });
    }
    Ok(())
}

/// Most recent record; records without a timestamp sort first.
pub fn latest_record(records: &[FluxRecord]) -> Option<&FluxRecord> {
    records.iter().max_by_key(|record| record.time)
}
