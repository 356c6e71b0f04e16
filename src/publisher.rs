//! MQTT publisher with Home Assistant discovery.
//!
//! 1. Registers the availability topic as Last Will (payload `offline`,
//!    retained) before the connection exists; the bridge publishes `online`
//!    right after each announce.
//! 2. Publishes one retained discovery config per entity: the alert binary
//!    sensor, the last report id sensor and the last warning count sensor.
//! 3. Publishes state topics only when they differ from the last published
//!    snapshot; retained messages make re-sends redundant, not harmful.
//!
//! Reconnects are observed on the connection-drain thread, which only bumps
//! an atomic generation counter. The bridge loop calls `ensure_announced`
//! each tick and republishes discovery + availability when the generation
//! moved; the drain thread never touches alert state.

use anyhow::{Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{DeviceIdentity, MqttSettings};
use crate::state::AlertState;
use crate::transport::build_transport;

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
pub const ALERT_ON: &str = "ON";
pub const ALERT_OFF: &str = "OFF";

/// Topic layout for one bridged device.
#[derive(Clone, Debug)]
pub struct Topics {
    pub availability: String,
    pub alert_state: String,
    pub report_id_state: String,
    pub warning_count_state: String,
    pub alert_config: String,
    pub report_id_config: String,
    pub warning_count_config: String,
}

impl Topics {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let prefix = identity.discovery_prefix.trim_matches('/');
        let device_id = identity.device_id.as_str();
        let root = format!("{}/{}", prefix, device_id);
        Self {
            availability: format!("{}/{}", root, identity.availability_suffix.trim_matches('/')),
            alert_state: format!("{}/alert/state", root),
            report_id_state: format!("{}/last_report_id/state", root),
            warning_count_state: format!("{}/last_warning_count/state", root),
            alert_config: format!("{}/binary_sensor/{}/alert/config", prefix, device_id),
            report_id_config: format!("{}/sensor/{}/last_report_id/config", prefix, device_id),
            warning_count_config: format!(
                "{}/sensor/{}/last_warning_count/config",
                prefix, device_id
            ),
        }
    }
}

/// Home Assistant device block shared by all entities.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl DeviceInfo {
    pub fn new(identity: &DeviceIdentity) -> Self {
        Self {
            identifiers: vec![identity.device_id.clone()],
            name: identity.device_name.clone(),
            manufacturer: "Cellwatch".to_string(),
            model: "USB Monitor".to_string(),
            sw_version: format!("bridge-{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Discovery config for the alert binary sensor.
#[derive(Serialize)]
struct BinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    device_class: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: DeviceInfo,
}

/// Discovery config for a plain sensor.
#[derive(Serialize)]
struct SensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    device: DeviceInfo,
}

/// Which state topics need a publish for a given [`AlertState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChanges {
    pub alert: bool,
    pub report_id: bool,
    pub warning_count: bool,
}

impl StateChanges {
    pub fn any(&self) -> bool {
        self.alert || self.report_id || self.warning_count
    }
}

/// Last values actually sent per state topic. Retained-message
/// de-duplication: matching fields are not re-published.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishedSnapshot {
    alert: Option<bool>,
    report_id: Option<String>,
    warning_count: Option<u32>,
}

impl PublishedSnapshot {
    pub fn diff(&self, state: &AlertState) -> StateChanges {
        StateChanges {
            alert: self.alert != Some(state.alert_active),
            // Never publish an absent id; keep the retained topic as-is.
            report_id: state.last_report_id.is_some() && self.report_id != state.last_report_id,
            warning_count: self.warning_count != Some(state.warning_count),
        }
    }

    /// Note what a completed publish pass sent. An absent report id keeps
    /// the previously published one, matching the publish rule.
    pub fn record(&mut self, state: &AlertState) {
        self.alert = Some(state.alert_active);
        if state.last_report_id.is_some() {
            self.report_id = state.last_report_id.clone();
        }
        self.warning_count = Some(state.warning_count);
    }

    /// Forget everything, forcing a full republish on the next state pass.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

pub struct Publisher {
    client: Client,
    topics: Topics,
    device: DeviceInfo,
    device_id: String,
    qos: QoS,
    retain: bool,
    snapshot: PublishedSnapshot,
    connection_generation: Arc<AtomicU64>,
    announced_generation: Option<u64>,
    stopping: Arc<AtomicBool>,
    drain: Option<JoinHandle<()>>,
}

impl Publisher {
    /// Build options (will included), start the client and the drain thread.
    /// The broker connection itself is established asynchronously; queued
    /// publishes flush once the CONNACK arrives.
    pub fn connect(settings: &MqttSettings, identity: &DeviceIdentity) -> Result<Self> {
        let topics = Topics::new(identity);
        let device = DeviceInfo::new(identity);

        let mut options = MqttOptions::new(
            &settings.client_id,
            &settings.endpoint.host,
            settings.endpoint.port,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_start(true);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        // The will must be registered before connecting so the broker emits
        // offline on any ungraceful drop.
        options.set_last_will(availability_will(&topics));
        options.set_transport(build_transport(&settings.endpoint, &settings.tls)?);

        let (client, connection) = Client::new(options, 10);
        let connection_generation = Arc::new(AtomicU64::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let drain = spawn_drain(connection, connection_generation.clone(), stopping.clone());

        log::info!(
            "MQTT client started for {}:{} (TLS: {}, auth: {})",
            settings.endpoint.host,
            settings.endpoint.port,
            settings.endpoint.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            topics,
            device,
            device_id: identity.device_id.clone(),
            qos: qos_from_level(settings.qos),
            retain: settings.retain,
            snapshot: PublishedSnapshot::default(),
            connection_generation,
            announced_generation: None,
            stopping,
            drain: Some(drain),
        })
    }

    /// Publish the discovery configs if this connection generation has not
    /// been announced yet. Called once per tick; returns whether it
    /// (re)announced so the caller can follow up with an availability
    /// publish. Clearing the snapshot forces the state topics to be
    /// refreshed right after.
    pub fn ensure_announced(&mut self) -> Result<bool> {
        let generation = self.connection_generation.load(Ordering::SeqCst);
        if self.announced_generation == Some(generation) {
            return Ok(false);
        }
        self.publish_discovery()?;
        self.snapshot.clear();
        self.announced_generation = Some(generation);
        log::info!(
            "discovery published for {} (connection generation {})",
            self.device_id,
            generation
        );
        Ok(true)
    }

    fn publish_discovery(&self) -> Result<()> {
        let alert = BinarySensorConfig {
            name: format!("{} Alert", self.device.name),
            unique_id: format!("{}_alert", self.device_id),
            state_topic: self.topics.alert_state.clone(),
            device_class: "safety".to_string(),
            availability_topic: self.topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: self.device.clone(),
        };
        self.publish_json(&self.topics.alert_config, &alert)?;

        let report_id = SensorConfig {
            name: format!("{} Last Report ID", self.device.name),
            unique_id: format!("{}_last_report_id", self.device_id),
            state_topic: self.topics.report_id_state.clone(),
            unit_of_measurement: None,
            availability_topic: self.topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: self.device.clone(),
        };
        self.publish_json(&self.topics.report_id_config, &report_id)?;

        let warning_count = SensorConfig {
            name: format!("{} Last Warning Count", self.device.name),
            unique_id: format!("{}_last_warning_count", self.device_id),
            state_topic: self.topics.warning_count_state.clone(),
            unit_of_measurement: Some("warnings".to_string()),
            availability_topic: self.topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: self.device.clone(),
        };
        self.publish_json(&self.topics.warning_count_config, &warning_count)?;

        Ok(())
    }

    /// Availability is always retained and safe to resend.
    pub fn publish_availability(&self, online: bool) -> Result<()> {
        let payload = if online { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.publish(&self.topics.availability, payload, true)
    }

    /// Publish the state topics that differ from the snapshot. The snapshot
    /// is recorded only after a full pass, so a failed publish makes the
    /// next tick retry; retained topics make the re-sends harmless.
    pub fn publish_state(&mut self, state: &AlertState) -> Result<()> {
        let changes = self.snapshot.diff(state);
        if changes.alert {
            let payload = if state.alert_active { ALERT_ON } else { ALERT_OFF };
            self.publish(&self.topics.alert_state, payload, self.retain)?;
        }
        if changes.report_id {
            if let Some(id) = &state.last_report_id {
                self.publish(&self.topics.report_id_state, id, self.retain)?;
            }
        }
        if changes.warning_count {
            let payload = state.warning_count.to_string();
            self.publish(&self.topics.warning_count_state, &payload, self.retain)?;
        }
        self.snapshot.record(state);
        Ok(())
    }

    /// Graceful teardown: retained `offline`, then disconnect and join the
    /// drain thread. The will does not fire on a clean disconnect, which is
    /// why offline is published explicitly here.
    pub fn shutdown(mut self) -> Result<()> {
        if let Err(e) = self.publish_availability(false) {
            log::warn!("offline publish on shutdown failed: {}", e);
        }
        self.stopping.store(true, Ordering::SeqCst);
        self.client.try_disconnect().context("mqtt disconnect")?;
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    // try_publish keeps a dead broker from ever blocking the poll tick; a
    // full request queue surfaces as an error and is retried next tick.
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, self.qos, retain, payload.as_bytes().to_vec())
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }

    fn publish_json<T: Serialize>(&self, topic: &str, config: &T) -> Result<()> {
        let payload = serde_json::to_vec(config)?;
        self.client
            .try_publish(topic, self.qos, true, payload)
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

fn availability_will(topics: &Topics) -> LastWill {
    LastWill::new(
        &topics.availability,
        PAYLOAD_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
        None,
    )
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn spawn_drain(
    mut connection: Connection,
    generation: Arc<AtomicU64>,
    stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    generation.fetch_add(1, Ordering::SeqCst);
                }
                Ok(_) => {}
                Err(e) => {
                    if stopping.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("MQTT connection error: {}", e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            device_id: "cellwatch_usb".to_string(),
            device_name: "Cellwatch (USB)".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            availability_suffix: "availability".to_string(),
        }
    }

    #[test]
    fn topic_layout_follows_discovery_convention() {
        let topics = Topics::new(&identity());
        assert_eq!(
            topics.availability,
            "homeassistant/cellwatch_usb/availability"
        );
        assert_eq!(topics.alert_state, "homeassistant/cellwatch_usb/alert/state");
        assert_eq!(
            topics.alert_config,
            "homeassistant/binary_sensor/cellwatch_usb/alert/config"
        );
        assert_eq!(
            topics.warning_count_config,
            "homeassistant/sensor/cellwatch_usb/last_warning_count/config"
        );
    }

    #[test]
    fn topic_layout_trims_stray_slashes() {
        let mut identity = identity();
        identity.discovery_prefix = "/homeassistant/".to_string();
        identity.availability_suffix = "/status".to_string();
        let topics = Topics::new(&identity);
        assert_eq!(topics.availability, "homeassistant/cellwatch_usb/status");
    }

    #[test]
    fn snapshot_dedupes_matching_fields() {
        let mut snapshot = PublishedSnapshot::default();
        let state = AlertState {
            warning_count: 2,
            last_report_id: Some("r1".to_string()),
            alert_active: true,
            ..AlertState::default()
        };

        let first = snapshot.diff(&state);
        assert!(first.alert && first.report_id && first.warning_count);

        snapshot.record(&state);
        assert!(!snapshot.diff(&state).any());
    }

    #[test]
    fn snapshot_detects_single_field_transitions() {
        let mut snapshot = PublishedSnapshot::default();
        let quiet = AlertState {
            warning_count: 0,
            last_report_id: Some("r1".to_string()),
            alert_active: false,
            ..AlertState::default()
        };
        snapshot.record(&quiet);

        let alerted = AlertState {
            alert_active: true,
            ..quiet
        };
        let changes = snapshot.diff(&alerted);
        assert!(changes.alert);
        assert!(!changes.report_id);
        assert!(!changes.warning_count);
    }

    #[test]
    fn snapshot_never_requests_absent_report_id() {
        let snapshot = PublishedSnapshot::default();
        let state = AlertState::default();
        assert!(!snapshot.diff(&state).report_id);
    }

    #[test]
    fn snapshot_keeps_published_id_across_idless_polls() {
        let mut snapshot = PublishedSnapshot::default();
        let with_id = AlertState {
            last_report_id: Some("r1".to_string()),
            ..AlertState::default()
        };
        snapshot.record(&with_id);

        let without_id = AlertState {
            last_report_id: None,
            ..AlertState::default()
        };
        snapshot.record(&without_id);
        assert!(!snapshot.diff(&with_id).report_id);
    }

    #[test]
    fn snapshot_clear_forces_full_republish() {
        let mut snapshot = PublishedSnapshot::default();
        let state = AlertState {
            warning_count: 3,
            last_report_id: Some("r1".to_string()),
            alert_active: true,
            ..AlertState::default()
        };
        snapshot.record(&state);
        assert!(!snapshot.diff(&state).any());

        snapshot.clear();
        let changes = snapshot.diff(&state);
        assert!(changes.alert && changes.report_id && changes.warning_count);
    }

    #[test]
    fn discovery_configs_serialize_required_keys() {
        let identity = identity();
        let topics = Topics::new(&identity);
        let device = DeviceInfo::new(&identity);

        let config = BinarySensorConfig {
            name: "Cellwatch (USB) Alert".to_string(),
            unique_id: "cellwatch_usb_alert".to_string(),
            state_topic: topics.alert_state.clone(),
            device_class: "safety".to_string(),
            availability_topic: topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device: device.clone(),
        };
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(json.contains("unique_id"));
        assert!(json.contains("state_topic"));
        assert!(json.contains("availability_topic"));
        assert!(json.contains("\"device_class\":\"safety\""));
        assert!(json.contains("cellwatch_usb"));

        let sensor = SensorConfig {
            name: "Cellwatch (USB) Last Warning Count".to_string(),
            unique_id: "cellwatch_usb_last_warning_count".to_string(),
            state_topic: topics.warning_count_state.clone(),
            unit_of_measurement: Some("warnings".to_string()),
            availability_topic: topics.availability.clone(),
            payload_available: PAYLOAD_ONLINE.to_string(),
            payload_not_available: PAYLOAD_OFFLINE.to_string(),
            device,
        };
        let json = serde_json::to_string(&sensor).expect("serialize");
        assert!(json.contains("\"unit_of_measurement\":\"warnings\""));

        // Absent unit is omitted entirely, not serialized as null.
        let sensor = SensorConfig {
            unit_of_measurement: None,
            ..sensor
        };
        let json = serde_json::to_string(&sensor).expect("serialize");
        assert!(!json.contains("unit_of_measurement"));
    }

    #[test]
    fn will_carries_retained_offline() {
        let will = availability_will(&Topics::new(&identity()));
        assert!(will.retain);
        assert_eq!(will.qos, QoS::AtLeastOnce);
        let rendered = format!("{:?}", will);
        assert!(rendered.contains("offline"));
    }

    #[test]
    fn qos_levels_map_to_rumqttc() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }
}
