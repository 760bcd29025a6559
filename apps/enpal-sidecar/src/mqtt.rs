use crate::catalog::{BATTERY_ESTIMATE, CATALOG};
use crate::config::Config;
use crate::discovery::sensor_unique_id;
use crate::scheduler::CycleReport;
use crate::telemetry::{SensorBoard, SensorView};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::{json, Value};
use std::iter;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const MQTT_KEEPALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Republishes the board to a Home Assistant broker. Every (re)connect
/// clears retained configs of catalog sensors this run did not discover and
/// publishes configs for the ones it did. States follow each poll cycle.
pub async fn run_publisher(
    config: Config,
    board: SensorBoard,
    mut cycles: mpsc::Receiver<CycleReport>,
) -> Result<()> {
    loop {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 64);

        loop {
            tokio::select! {
                report = cycles.recv() => {
                    let Some(report) = report else { return Ok(()); };
                    let published = publish_states(&client, &config, &board).await;
                    tracing::debug!(published, failed = report.failed, "published sensor states");
                }
                ev = eventloop.poll() => {
                    match ev {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            tracing::info!(host=%config.mqtt_host, port=config.mqtt_port, "connected to MQTT broker");
                            publish_discovery(&client, &config, &board).await;
                            publish_states(&client, &config, &board).await;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        sleep(RECONNECT_DELAY).await;
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(MQTT_KEEPALIVE);
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

async fn publish_discovery(client: &AsyncClient, config: &Config, board: &SensorBoard) {
    for topic in stale_discovery_topics(config, board) {
        if let Err(err) = client
            .publish(topic.clone(), QoS::AtLeastOnce, true, Vec::<u8>::new())
            .await
        {
            tracing::warn!(error=%err, topic=%topic, "failed to clear stale discovery config");
        }
    }
    for view in board.iter() {
        let topic = discovery_topic(&config.mqtt_discovery_prefix, view.id);
        let payload = discovery_payload(config, view);
        if let Err(err) = client
            .publish(topic, QoS::AtLeastOnce, true, payload.to_string())
            .await
        {
            tracing::warn!(error=%err, sensor = view.descriptor.object_id, "failed to publish discovery config");
        }
    }
}

async fn publish_states(client: &AsyncClient, config: &Config, board: &SensorBoard) -> usize {
    let mut published = 0;
    for view in board.iter() {
        let Some(payload) = state_payload(view) else {
            continue;
        };
        let topic = state_topic(&config.mqtt_topic_prefix, view);
        match client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_string())
            .await
        {
            Ok(()) => published += 1,
            Err(err) => {
                tracing::debug!(error=%err, sensor = view.descriptor.object_id, "failed to publish state");
            }
        }
    }
    published
}

fn discovery_topic(prefix: &str, id: Uuid) -> String {
    format!("{prefix}/sensor/{id}/config")
}

/// Config topics of every sensor this installation could own but did not
/// discover this run. IDs are deterministic, so earlier runs used the same.
fn stale_discovery_topics(config: &Config, board: &SensorBoard) -> Vec<String> {
    CATALOG
        .iter()
        .chain(iter::once(&BATTERY_ESTIMATE))
        .map(|descriptor| sensor_unique_id(&config.installation_name, descriptor))
        .filter(|id| board.get(*id).is_none())
        .map(|id| discovery_topic(&config.mqtt_discovery_prefix, id))
        .collect()
}

fn state_topic(prefix: &str, view: &SensorView) -> String {
    format!("{prefix}/{}/state", view.descriptor.object_id)
}

fn discovery_payload(config: &Config, view: &SensorView) -> Value {
    let descriptor = view.descriptor;
    let state_topic = state_topic(&config.mqtt_topic_prefix, view);
    json!({
        "name": descriptor.display_name,
        "unique_id": view.id.to_string(),
        "object_id": descriptor.object_id,
        "icon": descriptor.icon,
        "unit_of_measurement": descriptor.unit,
        "device_class": descriptor.device_class.as_str(),
        "state_class": "measurement",
        "state_topic": state_topic,
        "value_template": "{{ value_json.value if value_json.value is not none else 'unknown' }}",
        "json_attributes_topic": state_topic,
        "device": {
            "identifiers": [format!("enpal-{}", config.installation_name)],
            "name": config.installation_name,
            "manufacturer": "Enpal",
        },
    })
}

/// `None` until the sensor's first tick has completed.
fn state_payload(view: &SensorView) -> Option<Value> {
    let observation = view.current();
    if observation.is_pending() {
        return None;
    }
    Some(json!({
        "value": observation.value,
        "error": observation.error,
        "last_check": observation.observed_at.to_rfc3339(),
        "measurement": view.descriptor.measurement,
        "field": view.descriptor.field,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{lookup, BATTERY_ESTIMATE};
    use crate::telemetry::SensorObservation;
    use chrono::{DateTime, Utc};
    use tokio::sync::watch;
    use uuid::Uuid;

    fn config() -> Config {
        Config {
            enpal_host: "192.168.1.40".to_string(),
            enpal_port: 8086,
            enpal_token: "token".to_string(),
            influx_org: "my-new-org".to_string(),
            influx_bucket: "my-new-bucket".to_string(),
            installation_name: "Enpal Solar Installation".to_string(),
            poll_interval_secs: 120,
            query_window_secs: 300,
            query_bucket_secs: 120,
            query_timeout_secs: 30,
            discovery_retry_secs: 30,
            battery_max_capacity: 10.0,
            http_bind: "127.0.0.1:9102".to_string(),
            enable_mqtt: true,
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_username: Some("ha".to_string()),
            mqtt_password: None,
            mqtt_client_id: "enpal-sidecar-test".to_string(),
            mqtt_discovery_prefix: "homeassistant".to_string(),
            mqtt_topic_prefix: "enpal".to_string(),
            otlp_endpoint: None,
        }
    }

    fn observed_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn topics_follow_prefixes() {
        let descriptor = lookup("phasePowerAc", "Phase2").expect("descriptor");
        let (_tx, rx) = watch::channel(SensorObservation::pending(descriptor, observed_at()));
        let view = SensorView::new(Uuid::nil(), descriptor, rx);
        assert_eq!(
            discovery_topic("homeassistant", view.id),
            "homeassistant/sensor/00000000-0000-0000-0000-000000000000/config"
        );
        assert_eq!(state_topic("enpal", &view), "enpal/ac_power_phase_2/state");
    }

    #[test]
    fn discovery_payload_describes_the_sensor() {
        let descriptor = lookup("inverterTemperature", "Temperature").expect("descriptor");
        let (_tx, rx) = watch::channel(SensorObservation::pending(descriptor, observed_at()));
        let id = Uuid::new_v4();
        let view = SensorView::new(id, descriptor, rx);

        let payload = discovery_payload(&config(), &view);
        assert_eq!(payload["unique_id"], id.to_string());
        assert_eq!(payload["name"], descriptor.display_name);
        assert_eq!(payload["unit_of_measurement"], "°C");
        assert_eq!(payload["device_class"], "temperature");
        assert_eq!(payload["state_class"], "measurement");
        assert_eq!(payload["state_topic"], "enpal/inverter_temperature/state");
        assert_eq!(payload["json_attributes_topic"], payload["state_topic"]);
        assert_eq!(payload["device"]["name"], "Enpal Solar Installation");
    }

    #[test]
    fn state_payload_reports_errors_without_value() {
        let (tx, rx) = watch::channel(SensorObservation::healthy(
            &BATTERY_ESTIMATE,
            6.5,
            observed_at(),
        ));
        let view = SensorView::new(Uuid::nil(), &BATTERY_ESTIMATE, rx);

        let payload = state_payload(&view).expect("payload");
        assert_eq!(payload["value"], 6.5);
        assert_eq!(payload["error"], false);
        assert_eq!(payload["last_check"], "2024-05-01T10:00:00+00:00");
        assert_eq!(payload["measurement"], "batteryEstimate");
        assert_eq!(payload["field"], "Capacity");

        tx.send_replace(SensorObservation::failed(&BATTERY_ESTIMATE, observed_at()));
        let payload = state_payload(&view).expect("payload");
        assert_eq!(payload["value"], Value::Null);
        assert_eq!(payload["error"], true);
    }

    #[test]
    fn options_use_configured_client() {
        let options = mqtt_options(&config());
        assert_eq!(options.client_id(), "enpal-sidecar-test");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(options.keep_alive(), MQTT_KEEPALIVE);
    }

    #[test]
    fn pending_sensors_publish_no_state() {
        let descriptor = lookup("gridFrequency", "Frequenz").expect("descriptor");
        let (tx, rx) = watch::channel(SensorObservation::pending(descriptor, observed_at()));
        let view = SensorView::new(Uuid::nil(), descriptor, rx);
        assert!(state_payload(&view).is_none());

        tx.send_replace(SensorObservation::healthy(descriptor, 50.01, observed_at()));
        assert_eq!(state_payload(&view).expect("payload")["value"], 50.01);
    }

    #[test]
    fn value_template_maps_missing_value_to_unknown() {
        let descriptor = lookup("gridFrequency", "Frequenz").expect("descriptor");
        let (_tx, rx) = watch::channel(SensorObservation::pending(descriptor, observed_at()));
        let view = SensorView::new(Uuid::nil(), descriptor, rx);
        let payload = discovery_payload(&config(), &view);
        let template = payload["value_template"].as_str().expect("template");
        assert!(template.contains("is not none"));
        assert!(template.contains("'unknown'"));
    }

    #[test]
    fn undiscovered_catalog_sensors_get_their_configs_cleared() {
        let config = config();
        let production = lookup("Gesamtleistung", "Produktion").expect("production");
        let consumption = lookup("Gesamtleistung", "Verbrauch").expect("consumption");
        let production_id = sensor_unique_id(&config.installation_name, production);
        let consumption_id = sensor_unique_id(&config.installation_name, consumption);
        let (_ptx, prx) = watch::channel(SensorObservation::pending(production, observed_at()));
        let (_ctx, crx) = watch::channel(SensorObservation::pending(consumption, observed_at()));
        let board = SensorBoard::new(vec![
            SensorView::new(production_id, production, prx),
            SensorView::new(consumption_id, consumption, crx),
        ]);

        let stale = stale_discovery_topics(&config, &board);
        assert_eq!(stale.len(), CATALOG.len() + 1 - 2);
        assert!(!stale.contains(&discovery_topic("homeassistant", production_id)));
        assert!(!stale.contains(&discovery_topic("homeassistant", consumption_id)));

        let battery_id = sensor_unique_id(&config.installation_name, &BATTERY_ESTIMATE);
        assert!(stale.contains(&discovery_topic("homeassistant", battery_id)));
        let frequency = lookup("gridFrequency", "Frequenz").expect("frequency");
        let frequency_id = sensor_unique_id(&config.installation_name, frequency);
        assert!(stale.contains(&discovery_topic("homeassistant", frequency_id)));
        assert!(stale.iter().all(|topic| topic.starts_with("homeassistant/sensor/")));

        assert_eq!(
            stale_discovery_topics(&config, &SensorBoard::default()).len(),
            CATALOG.len() + 1
        );
    }
}
