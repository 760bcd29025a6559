use crate::discovery::DiscoveredSensor;
use crate::error::{QueryError, TickError};
use crate::influx::{latest_record, TimeSeriesSource};
use crate::telemetry::{SensorObservation, SensorView};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub window: Duration,
    pub every: Duration,
    pub timeout: Duration,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            every: Duration::from_secs(2 * 60),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Owns one discovered sensor's observation. Nothing else writes it.
pub struct SensorPoller<S> {
    sensor: DiscoveredSensor,
    source: Arc<S>,
    query: QueryWindow,
    tx: watch::Sender<SensorObservation>,
}

impl<S: TimeSeriesSource> SensorPoller<S> {
    pub fn new(
        sensor: DiscoveredSensor,
        source: Arc<S>,
        query: QueryWindow,
        now: DateTime<Utc>,
    ) -> Self {
        let (tx, _rx) = watch::channel(SensorObservation::pending(sensor.descriptor, now));
        Self {
            sensor,
            source,
            query,
            tx,
        }
    }

    pub fn sensor(&self) -> &DiscoveredSensor {
        &self.sensor
    }

    pub fn view(&self) -> SensorView {
        SensorView::new(self.sensor.id, self.sensor.descriptor, self.tx.subscribe())
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> SensorObservation {
        let descriptor = self.sensor.descriptor;
        let observation = match self.read_value().await {
            Ok(value) => {
                tracing::debug!(sensor = descriptor.object_id, value, "sensor updated");
                SensorObservation::healthy(descriptor, value, now)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    sensor = descriptor.object_id,
                    measurement = descriptor.measurement,
                    field = descriptor.field,
                    transport = err.is_transport(),
                    "sensor poll failed"
                );
                SensorObservation::failed(descriptor, now)
            }
        };
        self.tx.send_replace(observation.clone());
        observation
    }

    async fn read_value(&self) -> Result<f64, TickError> {
        let descriptor = self.sensor.descriptor;
        let records = timeout(
            self.query.timeout,
            self.source.query(
                descriptor.measurement,
                descriptor.field,
                self.query.window,
                self.query.every,
            ),
        )
        .await
        .map_err(|_| QueryError::Timeout(self.query.timeout))??;
        let record = latest_record(&records).ok_or(TickError::NoData)?;
        let raw = parse_value(&record.value)?;
        Ok(descriptor.convert(raw))
    }
}

pub fn parse_value(raw: &str) -> Result<f64, TickError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| TickError::Parse {
            raw: raw.to_string(),
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::lookup;
    use crate::discovery::sensor_unique_id;
    use crate::influx::FluxRecord;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory source keyed by (measurement, field). Missing keys fail the
    /// query like an unreachable box would. The snapshot counters make the
    /// next N `query_all` calls fail or hang.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        values: Mutex<HashMap<(String, String), Vec<String>>>,
        pub(crate) delay: Option<Duration>,
        failing_snapshots: AtomicUsize,
        stalled_snapshots: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn set(&self, measurement: &str, field: &str, values: &[&str]) {
            let mut guard = self.values.lock().expect("lock");
            guard.insert(
                (measurement.to_string(), field.to_string()),
                values.iter().map(|value| value.to_string()).collect(),
            );
        }

        pub(crate) fn fail_snapshots(&self, count: usize) {
            self.failing_snapshots.store(count, Ordering::SeqCst);
        }

        pub(crate) fn stall_snapshots(&self, count: usize) {
            self.stalled_snapshots.store(count, Ordering::SeqCst);
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }

        pub(crate) fn remove(&self, measurement: &str, field: &str) {
            let mut guard = self.values.lock().expect("lock");
            guard.remove(&(measurement.to_string(), field.to_string()));
        }

        fn records(&self, measurement: &str, field: &str) -> Option<Vec<FluxRecord>> {
            let guard = self.values.lock().expect("lock");
            let values = guard.get(&(measurement.to_string(), field.to_string()))?;
            let base = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .expect("ts")
                .with_timezone(&Utc);
            Some(
                values
                    .iter()
                    .enumerate()
                    .map(|(idx, value)| FluxRecord {
                        measurement: measurement.to_string(),
                        field: field.to_string(),
                        value: value.clone(),
                        time: Some(base + chrono::Duration::minutes(2 * idx as i64)),
                    })
                    .collect(),
            )
        }
    }

    impl TimeSeriesSource for FakeSource {
        async fn query(
            &self,
            measurement: &str,
            field: &str,
            _window: Duration,
            _every: Duration,
        ) -> Result<Vec<FluxRecord>, QueryError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.records(measurement, field).ok_or(QueryError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }

        async fn query_all(
            &self,
            _window: Duration,
            _every: Duration,
        ) -> Result<Vec<FluxRecord>, QueryError> {
            if Self::take(&self.stalled_snapshots) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if Self::take(&self.failing_snapshots) {
                return Err(QueryError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            let keys: Vec<(String, String)> =
                self.values.lock().expect("lock").keys().cloned().collect();
            Ok(keys
                .iter()
                .filter_map(|(measurement, field)| self.records(measurement, field))
                .flatten()
                .collect())
        }
    }

    fn poller(source: Arc<FakeSource>, measurement: &str, field: &str) -> SensorPoller<FakeSource> {
        let descriptor = lookup(measurement, field).expect("descriptor");
        let sensor = DiscoveredSensor {
            id: sensor_unique_id("test", descriptor),
            descriptor,
        };
        SensorPoller::new(sensor, source, QueryWindow::default(), Utc::now())
    }

    #[tokio::test]
    async fn healthy_tick_uses_latest_bucket() {
        let source = Arc::new(FakeSource::default());
        source.set("gridFrequency", "Frequenz", &["49.98", "50.02"]);
        let poller = poller(source, "gridFrequency", "Frequenz");
        let view = poller.view();
        let now = Utc::now();

        let observation = poller.tick(now).await;
        assert_eq!(observation.value, Some(50.02));
        assert!(!observation.error);
        assert_eq!(observation.unit, "Hz");
        assert_eq!(observation.observed_at, now);
        assert_eq!(view.current(), observation);
    }

    #[tokio::test]
    async fn dc_current_is_scaled_to_amps() {
        let source = Arc::new(FakeSource::default());
        source.set("productionCurrentDc", "String1", &["1500"]);
        let poller = poller(source, "productionCurrentDc", "String1");
        let observation = poller.tick(Utc::now()).await;
        assert_eq!(observation.value, Some(1.5));
        assert_eq!(observation.unit, "A");
    }

    #[tokio::test]
    async fn transport_failure_reports_absent_value() {
        let source = Arc::new(FakeSource::default());
        let poller = poller(source, "phasePowerAc", "Phase1");
        let now = Utc::now();
        let observation = poller.tick(now).await;
        assert!(observation.error);
        assert_eq!(observation.value, None);
        assert_eq!(observation.observed_at, now);
    }

    #[tokio::test]
    async fn empty_result_is_an_error() {
        let source = Arc::new(FakeSource::default());
        source.set("phasePowerAc", "Phase2", &[]);
        let poller = poller(source.clone(), "phasePowerAc", "Phase2");
        let err = poller.read_value().await.expect_err("no data");
        assert!(matches!(err, TickError::NoData));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn unparsable_value_is_an_error() {
        let source = Arc::new(FakeSource::default());
        source.set("inverterTemperature", "Temperature", &["n/a"]);
        let poller = poller(source, "inverterTemperature", "Temperature");
        let err = poller.read_value().await.expect_err("parse");
        assert!(matches!(err, TickError::Parse { ref raw } if raw == "n/a"));
        assert!(!err.is_transport());
        assert!(poller.tick(Utc::now()).await.error);
    }

    #[tokio::test]
    async fn recovers_after_error_without_intervention() {
        let source = Arc::new(FakeSource::default());
        let poller = poller(source.clone(), "Gesamtleistung", "Produktion");
        assert!(poller.tick(Utc::now()).await.error);

        source.set("Gesamtleistung", "Produktion", &["2350"]);
        let observation = poller.tick(Utc::now()).await;
        assert!(!observation.error);
        assert_eq!(observation.value, Some(2350.0));

        source.remove("Gesamtleistung", "Produktion");
        assert_eq!(poller.tick(Utc::now()).await.value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out() {
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_secs(120)),
            ..FakeSource::default()
        });
        source.set("gridFrequency", "Frequenz", &["50.0"]);
        let poller = poller(source, "gridFrequency", "Frequenz");
        let err = poller.read_value().await.expect_err("timeout");
        assert!(matches!(
            err,
            TickError::Transport(QueryError::Timeout(_))
        ));
    }

    #[test]
    fn parse_value_rejects_non_finite() {
        assert_eq!(parse_value(" 41.5 ").expect("number"), 41.5);
        assert!(parse_value("NaN").is_err());
        assert!(parse_value("inf").is_err());
        assert!(parse_value("").is_err());
    }
}
