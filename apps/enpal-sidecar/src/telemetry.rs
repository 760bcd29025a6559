use crate::catalog::{DeviceClass, SensorDescriptor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

/// Latest reading of one sensor. `value` is `None` whenever the last tick
/// failed; a stale number is never carried over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorObservation {
    pub value: Option<f64>,
    pub unit: &'static str,
    pub device_class: DeviceClass,
    pub observed_at: DateTime<Utc>,
    pub error: bool,
}

impl SensorObservation {
    /// Placeholder until the first tick completes.
    pub fn pending(descriptor: &SensorDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            value: None,
            unit: descriptor.unit,
            device_class: descriptor.device_class,
            observed_at: now,
            error: false,
        }
    }

    pub fn healthy(descriptor: &SensorDescriptor, value: f64, now: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            ..Self::pending(descriptor, now)
        }
    }

    pub fn failed(descriptor: &SensorDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            error: true,
            ..Self::pending(descriptor, now)
        }
    }

    /// No tick has committed a value or an error yet.
    pub fn is_pending(&self) -> bool {
        self.value.is_none() && !self.error
    }

    /// The value, if it is usable as an input to something else.
    pub fn usable_value(&self) -> Option<f64> {
        if self.error {
            return None;
        }
        self.value.filter(|value| value.is_finite())
    }
}

/// Read-only handle on a sensor's committed observation.
#[derive(Clone, Debug)]
pub struct SensorView {
    pub id: Uuid,
    pub descriptor: &'static SensorDescriptor,
    observation: watch::Receiver<SensorObservation>,
}

impl SensorView {
    pub fn new(
        id: Uuid,
        descriptor: &'static SensorDescriptor,
        observation: watch::Receiver<SensorObservation>,
    ) -> Self {
        Self {
            id,
            descriptor,
            observation,
        }
    }

    pub fn current(&self) -> SensorObservation {
        self.observation.borrow().clone()
    }
}

/// Every sensor the host can see, in discovery order (battery last).
#[derive(Clone, Debug, Default)]
pub struct SensorBoard {
    views: Vec<SensorView>,
}

impl SensorBoard {
    pub fn new(views: Vec<SensorView>) -> Self {
        Self { views }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorView> {
        self.views.iter()
    }

    pub fn get(&self, id: Uuid) -> Option<&SensorView> {
        self.views.iter().find(|view| view.id == id)
    }

    #[cfg(test)]
    pub fn by_object_id(&self, object_id: &str) -> Option<&SensorView> {
        self.views
            .iter()
            .find(|view| view.descriptor.object_id == object_id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}
