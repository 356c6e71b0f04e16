//! Immutable bridge configuration.
//!
//! The daemon binary collects the flat CLI/env surface into these structs
//! once at startup; every component receives its slice by reference and
//! nothing reads the environment afterwards.

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::poller::PollerConfig;
use crate::state::AlertPolicy;
use crate::transport::{MqttEndpoint, TlsMaterials};

/// MQTT keep-alive never drops below this, whatever the poll cadence.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// How the bridged device presents itself to Home Assistant.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub discovery_prefix: String,
    pub availability_suffix: String,
}

/// Broker connection settings.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub retain: bool,
    pub keep_alive: Duration,
}

/// Everything the bridge needs, validated once at startup.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub poll_interval: Duration,
    /// Failure streak length that flips availability to offline.
    pub offline_after_failures: u32,
    pub poller: PollerConfig,
    pub policy: AlertPolicy,
    pub identity: DeviceIdentity,
    pub mqtt: MqttSettings,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.poller.timeout.is_zero() {
            return Err(anyhow!("http timeout must be greater than zero"));
        }
        if self.poller.backoff_base.is_zero() {
            return Err(anyhow!("http backoff base must be greater than zero"));
        }
        if self.offline_after_failures == 0 {
            return Err(anyhow!("offline failure threshold must be at least 1"));
        }
        if self.mqtt.qos > 2 {
            return Err(anyhow!("MQTT QoS must be 0, 1 or 2"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("MQTT client id must not be empty"));
        }
        validate_device_id(&self.identity.device_id)?;
        if self.identity.device_name.trim().is_empty() {
            return Err(anyhow!("device name must not be empty"));
        }
        if self.identity.discovery_prefix.trim_matches('/').is_empty() {
            return Err(anyhow!("discovery prefix must not be empty"));
        }
        if self.identity.availability_suffix.trim_matches('/').is_empty() {
            return Err(anyhow!("availability topic suffix must not be empty"));
        }
        Ok(())
    }
}

/// Device ids end up in topic paths and unique_ids; keep them boring.
pub fn validate_device_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("device id must not be empty"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!(
            "device id '{}' may only contain ASCII letters, digits, '_' and '-'",
            id
        ));
    }
    Ok(())
}

/// Keep-alive derived from the poll cadence so the broker notices a hung
/// bridge within a few missed ticks.
pub fn default_keep_alive(poll_interval: Duration) -> Duration {
    MIN_KEEP_ALIVE.max(poll_interval.saturating_mul(3))
}
