use serde::Serialize;

const ICON_SOLAR: &str = "mdi:solar-power";
const ICON_BOLT: &str = "mdi:lightning-bolt";
const ICON_THERMOMETER: &str = "mdi:thermometer";
const ICON_BATTERY: &str = "mdi:home-battery";

const UNIT_W: &str = "W";
const UNIT_A: &str = "A";
const UNIT_V: &str = "V";
const UNIT_HZ: &str = "Hz";
const UNIT_CELSIUS: &str = "°C";
const UNIT_KWH: &str = "kWh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Temperature,
    Frequency,
    Current,
    Voltage,
    Energy,
}

impl DeviceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Temperature => "temperature",
            Self::Frequency => "frequency",
            Self::Current => "current",
            Self::Voltage => "voltage",
            Self::Energy => "energy",
        }
    }
}

/// Which part a sensor plays for the battery estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorRole {
    Production,
    Consumption,
    Reading,
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueTransform {
    /// Divide the raw reading, e.g. mA -> A.
    Divide(f64),
}

impl ValueTransform {
    pub fn apply(self, raw: f64) -> f64 {
        match self {
            Self::Divide(divisor) => raw / divisor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorKey {
    pub measurement: &'static str,
    pub field: &'static str,
}

#[derive(Debug, PartialEq)]
pub struct SensorDescriptor {
    pub measurement: &'static str,
    pub field: &'static str,
    /// Slug used for topics and entity ids, e.g. `solar_production`.
    pub object_id: &'static str,
    pub display_name: &'static str,
    pub icon: &'static str,
    pub device_class: DeviceClass,
    pub unit: &'static str,
    pub role: SensorRole,
    pub transform: Option<ValueTransform>,
}

impl SensorDescriptor {
    pub fn key(&self) -> SensorKey {
        SensorKey {
            measurement: self.measurement,
            field: self.field,
        }
    }

    pub fn convert(&self, raw: f64) -> f64 {
        match self.transform {
            Some(transform) => transform.apply(raw),
            None => raw,
        }
    }
}

const fn reading(
    measurement: &'static str,
    field: &'static str,
    object_id: &'static str,
    display_name: &'static str,
    icon: &'static str,
    device_class: DeviceClass,
    unit: &'static str,
) -> SensorDescriptor {
    SensorDescriptor {
        measurement,
        field,
        object_id,
        display_name,
        icon,
        device_class,
        unit,
        role: SensorRole::Reading,
        transform: None,
    }
}

const MILLIAMPS: Option<ValueTransform> = Some(ValueTransform::Divide(1000.0));

/// Every (measurement, field) pair the Enpal box reports that we republish.
/// Anything not listed here is ignored during discovery.
pub static CATALOG: [SensorDescriptor; 11] = [
    SensorDescriptor {
        role: SensorRole::Production,
        ..reading(
            "Gesamtleistung",
            "Produktion",
            "solar_production",
            "Solar Production",
            ICON_SOLAR,
            DeviceClass::Power,
            UNIT_W,
        )
    },
    SensorDescriptor {
        role: SensorRole::Consumption,
        ..reading(
            "Gesamtleistung",
            "Verbrauch",
            "power_consumption",
            "Power Consumption",
            ICON_BOLT,
            DeviceClass::Power,
            UNIT_W,
        )
    },
    reading(
        "inverterTemperature",
        "Temperature",
        "inverter_temperature",
        "Inverter Temperature",
        ICON_THERMOMETER,
        DeviceClass::Temperature,
        UNIT_CELSIUS,
    ),
    reading(
        "gridFrequency",
        "Frequenz",
        "grid_frequency",
        "Grid Frequency",
        ICON_BOLT,
        DeviceClass::Frequency,
        UNIT_HZ,
    ),
    reading(
        "phasePowerAc",
        "Phase1",
        "ac_power_phase_1",
        "AC Power Phase 1",
        ICON_BOLT,
        DeviceClass::Power,
        UNIT_W,
    ),
    reading(
        "phasePowerAc",
        "Phase2",
        "ac_power_phase_2",
        "AC Power Phase 2",
        ICON_BOLT,
        DeviceClass::Power,
        UNIT_W,
    ),
    reading(
        "phasePowerAc",
        "Phase3",
        "ac_power_phase_3",
        "AC Power Phase 3",
        ICON_BOLT,
        DeviceClass::Power,
        UNIT_W,
    ),
    SensorDescriptor {
        transform: MILLIAMPS,
        ..reading(
            "productionCurrentDc",
            "String1",
            "dc_current_string_1",
            "DC Current String 1",
            ICON_SOLAR,
            DeviceClass::Current,
            UNIT_A,
        )
    },
    SensorDescriptor {
        transform: MILLIAMPS,
        ..reading(
            "productionCurrentDc",
            "String2",
            "dc_current_string_2",
            "DC Current String 2",
            ICON_SOLAR,
            DeviceClass::Current,
            UNIT_A,
        )
    },
    reading(
        "productionVoltageDc",
        "String1",
        "dc_voltage_string_1",
        "DC Voltage String 1",
        ICON_SOLAR,
        DeviceClass::Voltage,
        UNIT_V,
    ),
    reading(
        "productionVoltageDc",
        "String2",
        "dc_voltage_string_2",
        "DC Voltage String 2",
        ICON_SOLAR,
        DeviceClass::Voltage,
        UNIT_V,
    ),
];

/// The derived battery sensor. It is never queried, so its measurement/field
/// only label the published state.
pub static BATTERY_ESTIMATE: SensorDescriptor = SensorDescriptor {
    measurement: "batteryEstimate",
    field: "Capacity",
    object_id: "battery_capacity_estimate",
    display_name: "Battery Capacity Estimate",
    icon: ICON_BATTERY,
    device_class: DeviceClass::Energy,
    unit: UNIT_KWH,
    role: SensorRole::Derived,
    transform: None,
};

/// Exact, case-sensitive lookup.
pub fn lookup(measurement: &str, field: &str) -> Option<&'static SensorDescriptor> {
    CATALOG
        .iter()
        .find(|entry| entry.measurement == measurement && entry.field == field)
}
