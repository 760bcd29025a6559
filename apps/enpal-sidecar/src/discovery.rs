use crate::battery::BatteryEstimatorState;
use crate::catalog::{self, SensorDescriptor, SensorKey, SensorRole, BATTERY_ESTIMATE};
use crate::error::PreconditionUnmet;
use crate::influx::{FluxRecord, TimeSeriesSource};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub installation: String,
    pub max_capacity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredSensor {
    pub id: Uuid,
    pub descriptor: &'static SensorDescriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatterySeed {
    pub id: Uuid,
    pub state: BatteryEstimatorState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub sensors: Vec<DiscoveredSensor>,
    pub battery: Option<BatterySeed>,
}

impl Discovery {
    #[cfg(test)]
    pub fn sensor_with_role(&self, role: SensorRole) -> Option<&DiscoveredSensor> {
        self.sensors
            .iter()
            .find(|sensor| sensor.descriptor.role == role)
    }
}

/// Maps one snapshot onto the catalog. Unknown pairs are skipped and
/// duplicate keys keep their first occurrence.
pub fn discover(
    records: &[FluxRecord],
    settings: &DiscoverySettings,
    now: DateTime<Utc>,
) -> Discovery {
    let mut seen: HashSet<SensorKey> = HashSet::new();
    let mut sensors = Vec::new();

    for record in records {
        let Some(descriptor) = catalog::lookup(&record.measurement, &record.field) else {
            tracing::trace!(
                measurement = %record.measurement,
                field = %record.field,
                "ignoring series not in catalog"
            );
            continue;
        };
        if !seen.insert(descriptor.key()) {
            continue;
        }
        sensors.push(DiscoveredSensor {
            id: sensor_unique_id(&settings.installation, descriptor),
            descriptor,
        });
    }

    let battery = match battery_precondition(&sensors) {
        Ok(()) => Some(BatterySeed {
            id: sensor_unique_id(&settings.installation, &BATTERY_ESTIMATE),
            state: BatteryEstimatorState::full(settings.max_capacity, now),
        }),
        Err(err) => {
            tracing::debug!(error = %err, "battery estimate disabled");
            None
        }
    };

    Discovery { sensors, battery }
}

pub fn battery_precondition(sensors: &[DiscoveredSensor]) -> Result<(), PreconditionUnmet> {
    let has = |role: SensorRole| sensors.iter().any(|sensor| sensor.descriptor.role == role);
    if !has(SensorRole::Production) {
        return Err(PreconditionUnmet {
            missing: "production",
        });
    }
    if !has(SensorRole::Consumption) {
        return Err(PreconditionUnmet {
            missing: "consumption",
        });
    }
    Ok(())
}

/// Stable across restarts, so the host does not collect orphaned entities.
pub fn sensor_unique_id(installation: &str, descriptor: &SensorDescriptor) -> Uuid {
    let name = format!(
        "enpal/{}/{}/{}",
        installation, descriptor.measurement, descriptor.field
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Takes the startup snapshot, retrying until the box answers.
pub async fn discover_with_retry<S: TimeSeriesSource>(
    source: &S,
    settings: &DiscoverySettings,
    window: Duration,
    every: Duration,
    query_timeout: Duration,
    retry_delay: Duration,
) -> Discovery {
    loop {
        match timeout(query_timeout, source.query_all(window, every)).await {
            Ok(Ok(records)) => {
                let discovery = discover(&records, settings, Utc::now());
                tracing::info!(
                    records = records.len(),
                    sensors = discovery.sensors.len(),
                    battery = discovery.battery.is_some(),
                    "discovery complete"
                );
                return discovery;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "discovery query failed; retrying");
            }
            Err(_) => {
                tracing::warn!(timeout = ?query_timeout, "discovery query timed out; retrying");
            }
        }
        sleep(retry_delay).await;
    }
}
