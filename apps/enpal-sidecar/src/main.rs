mod battery;
mod catalog;
mod config;
mod discovery;
mod error;
mod http;
mod influx;
mod mqtt;
mod poller;
mod scheduler;
mod telemetry;

use crate::config::Config;
use crate::discovery::{discover_with_retry, DiscoverySettings};
use crate::http::HttpState;
use crate::influx::InfluxClient;
use crate::poller::QueryWindow;
use crate::scheduler::{CycleReport, Scheduler};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::future;
use std::sync::Arc;
use tokio::sync::mpsc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,enpal_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "enpal-sidecar"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() || trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let source = Arc::new(InfluxClient::new(&config)?);
    let settings = DiscoverySettings {
        installation: config.installation_name.clone(),
        max_capacity: config.battery_max_capacity,
    };
    let query = QueryWindow {
        window: config.query_window(),
        every: config.query_bucket(),
        timeout: config.query_timeout(),
    };

    tracing::info!(
        host = %config.enpal_host,
        port = config.enpal_port,
        bucket = %config.influx_bucket,
        "discovering Enpal sensors"
    );
    let discovery = tokio::select! {
        discovery = discover_with_retry(
            source.as_ref(),
            &settings,
            query.window,
            query.every,
            query.timeout,
            config.discovery_retry(),
        ) => discovery,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received during discovery");
            return Ok(());
        }
    };

    let scheduler = Scheduler::from_discovery(discovery, source, query, Utc::now());
    let board = scheduler.board();
    if board.is_empty() {
        tracing::warn!("no catalog sensors reported by the box; only the health endpoint is useful");
    }
    tracing::info!(
        sensors = board.len(),
        battery = scheduler.has_battery(),
        "sensors registered"
    );

    let (cycle_tx, cycle_rx) = mpsc::channel::<CycleReport>(4);
    let mqtt_handle = if config.enable_mqtt {
        let mqtt_config = config.clone();
        let mqtt_board = board.clone();
        Some(tokio::spawn(async move {
            mqtt::run_publisher(mqtt_config, mqtt_board, cycle_rx).await
        }))
    } else {
        drop(cycle_rx);
        None
    };
    let cycles = config.enable_mqtt.then_some(cycle_tx);
    let scheduler_handle = scheduler::spawn(scheduler, config.poll_interval(), cycles);

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "HTTP read API listening");
    let app = http::router(HttpState { board });
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = scheduler_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "scheduler task failed"); }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(error=%err, "MQTT publisher exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
