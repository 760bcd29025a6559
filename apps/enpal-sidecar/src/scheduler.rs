use crate::battery::BatteryEstimator;
use crate::catalog::SensorRole;
use crate::discovery::Discovery;
use crate::influx::TimeSeriesSource;
use crate::poller::{QueryWindow, SensorPoller};
use crate::telemetry::{SensorBoard, SensorView};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    pub healthy: usize,
    pub failed: usize,
    pub battery: Option<Option<f64>>,
}

/// Runs every unit once per cycle: plain sensors first (concurrently), the
/// battery estimator strictly after them.
pub struct Scheduler<S> {
    pollers: Vec<SensorPoller<S>>,
    battery: Option<BatteryEstimator>,
}

impl<S: TimeSeriesSource> Scheduler<S> {
    pub fn from_discovery(
        discovery: Discovery,
        source: Arc<S>,
        query: QueryWindow,
        now: DateTime<Utc>,
    ) -> Self {
        let pollers: Vec<SensorPoller<S>> = discovery
            .sensors
            .into_iter()
            .map(|sensor| SensorPoller::new(sensor, source.clone(), query, now))
            .collect();

        let view_for = |role: SensorRole| -> Option<SensorView> {
            pollers
                .iter()
                .find(|poller| poller.sensor().descriptor.role == role)
                .map(SensorPoller::view)
        };
        let battery = match (
            discovery.battery,
            view_for(SensorRole::Production),
            view_for(SensorRole::Consumption),
        ) {
            (Some(seed), Some(production), Some(consumption)) => {
                match BatteryEstimator::new(seed, production, consumption) {
                    Ok(estimator) => Some(estimator),
                    Err(err) => {
                        tracing::warn!(error = %err, "battery estimator not created");
                        None
                    }
                }
            }
            _ => None,
        };

        Self { pollers, battery }
    }

    pub fn board(&self) -> SensorBoard {
        let mut views: Vec<SensorView> = self.pollers.iter().map(SensorPoller::view).collect();
        if let Some(battery) = &self.battery {
            views.push(battery.view());
        }
        SensorBoard::new(views)
    }

    pub fn has_battery(&self) -> bool {
        self.battery.is_some()
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let mut ticks = Vec::with_capacity(self.pollers.len());
        for poller in &self.pollers {
            ticks.push(poller.tick(now));
        }
        let observations = join_all(ticks).await;
        let failed = observations.iter().filter(|obs| obs.error).count();
        let battery = self.battery.as_mut().map(|battery| battery.tick(now).value);
        CycleReport {
            at: now,
            healthy: observations.len() - failed,
            failed,
            battery,
        }
    }
}

/// Drives the scheduler on a fixed period. The first cycle runs immediately.
/// Finished cycles are announced on `cycles` (dropped if the reader lags).
pub fn spawn<S: TimeSeriesSource>(
    mut scheduler: Scheduler<S>,
    period: Duration,
    cycles: Option<mpsc::Sender<CycleReport>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = scheduler.run_cycle(Utc::now()).await;
            tracing::info!(
                healthy = report.healthy,
                failed = report.failed,
                battery = ?report.battery,
                "poll cycle complete"
            );
            if let Some(tx) = &cycles {
                if let Err(err) = tx.try_send(report) {
                    tracing::warn!(error=%err, "cycle listener lagging; dropping notification");
                }
            }
        }
    })
}
