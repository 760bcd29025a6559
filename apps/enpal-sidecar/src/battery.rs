use crate::catalog::{SensorRole, BATTERY_ESTIMATE};
use crate::discovery::BatterySeed;
use crate::error::{PreconditionUnmet, TickError};
use crate::telemetry::{SensorObservation, SensorView};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Running battery estimate. `capacity` is `None` after a failed tick, which
/// makes the next good tick start again from `max_capacity`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryEstimatorState {
    pub capacity: Option<f64>,
    pub max_capacity: f64,
    pub last_observed_at: DateTime<Utc>,
    pub error: bool,
}

impl BatteryEstimatorState {
    /// Cold start assumes a full battery; there is no measurement to seed from.
    pub fn full(max_capacity: f64, now: DateTime<Utc>) -> Self {
        Self {
            capacity: Some(max_capacity),
            max_capacity,
            last_observed_at: now,
            error: false,
        }
    }

    /// Integrates `production - consumption` over the wall-clock time since
    /// the last tick, assuming both stayed constant over the gap.
    pub fn advance(&self, production: f64, consumption: f64, now: DateTime<Utc>) -> Self {
        let elapsed_hours = elapsed_hours(self.last_observed_at, now);
        let previous = self.capacity.unwrap_or(self.max_capacity);
        let capacity = integrate(
            previous,
            production - consumption,
            elapsed_hours,
            self.max_capacity,
        );
        Self {
            capacity: Some(capacity),
            max_capacity: self.max_capacity,
            last_observed_at: now,
            error: false,
        }
    }

    /// Time still moves forward so the next good tick does not integrate
    /// across the whole outage.
    pub fn fail(&self, now: DateTime<Utc>) -> Self {
        Self {
            capacity: None,
            max_capacity: self.max_capacity,
            last_observed_at: now,
            error: true,
        }
    }

    pub fn observation(&self) -> SensorObservation {
        if self.error {
            return SensorObservation::failed(&BATTERY_ESTIMATE, self.last_observed_at);
        }
        match self.capacity {
            Some(capacity) => {
                SensorObservation::healthy(&BATTERY_ESTIMATE, capacity, self.last_observed_at)
            }
            None => SensorObservation::pending(&BATTERY_ESTIMATE, self.last_observed_at),
        }
    }
}

/// Negative gaps (clock stepped backwards) count as zero.
pub fn elapsed_hours(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds().max(0) as f64 / MILLIS_PER_HOUR
}

/// A non-finite delta (overflowing inputs) leaves the previous capacity as is.
pub fn integrate(previous: f64, net_power: f64, elapsed_hours: f64, max_capacity: f64) -> f64 {
    let delta = net_power * elapsed_hours;
    if !delta.is_finite() {
        return previous.clamp(0.0, max_capacity);
    }
    (previous + delta).clamp(0.0, max_capacity)
}

pub struct BatteryEstimator {
    id: Uuid,
    state: BatteryEstimatorState,
    production: SensorView,
    consumption: SensorView,
    tx: watch::Sender<SensorObservation>,
}

impl BatteryEstimator {
    pub fn new(
        seed: BatterySeed,
        production: SensorView,
        consumption: SensorView,
    ) -> Result<Self, PreconditionUnmet> {
        if production.descriptor.role != SensorRole::Production {
            return Err(PreconditionUnmet {
                missing: "production",
            });
        }
        if consumption.descriptor.role != SensorRole::Consumption {
            return Err(PreconditionUnmet {
                missing: "consumption",
            });
        }
        let (tx, _rx) = watch::channel(seed.state.observation());
        Ok(Self {
            id: seed.id,
            state: seed.state,
            production,
            consumption,
            tx,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> &BatteryEstimatorState {
        &self.state
    }

    pub fn view(&self) -> SensorView {
        SensorView::new(self.id, &BATTERY_ESTIMATE, self.tx.subscribe())
    }

    /// Must run after the production and consumption pollers committed
    /// their tick for this cycle.
    pub fn tick(&mut self, now: DateTime<Utc>) -> SensorObservation {
        self.state = match self.read_inputs() {
            Ok((production, consumption)) => {
                let next = self.state.advance(production, consumption, now);
                tracing::debug!(
                    production,
                    consumption,
                    capacity = ?next.capacity,
                    "battery estimate updated"
                );
                next
            }
            Err(err) => {
                tracing::warn!(error = %err, "battery estimate tick failed");
                self.state.fail(now)
            }
        };
        let observation = self.state.observation();
        self.tx.send_replace(observation.clone());
        observation
    }

    fn read_inputs(&self) -> Result<(f64, f64), TickError> {
        let production = self
            .production
            .current()
            .usable_value()
            .ok_or(TickError::InputUnavailable(self.production.descriptor.object_id))?;
        let consumption = self
            .consumption
            .current()
            .usable_value()
            .ok_or(TickError::InputUnavailable(self.consumption.descriptor.object_id))?;
        Ok((production, consumption))
    }
}
