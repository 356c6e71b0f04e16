//! cellwatch_bridge - Bridge a USB-tethered cellular monitor to MQTT.
//!
//! This daemon:
//! 1. Polls the monitor's loopback HTTP API for warning counts and report ids
//! 2. Derives a debounced alert state (debounce, force window, autoclear)
//! 3. Publishes Home Assistant discovery configs and retained state topics
//! 4. Tracks liveness via a Last Will on the availability topic
//!
//! Entities created in Home Assistant:
//! - binary_sensor.<device>_alert: debounced alert (device_class: safety)
//! - sensor.<device>_last_report_id: most recent analysis report id
//! - sensor.<device>_last_warning_count: last known warning count

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use cellwatch_bridge::config::{default_keep_alive, BridgeConfig, DeviceIdentity, MqttSettings};
use cellwatch_bridge::poller::PollerConfig;
use cellwatch_bridge::state::AlertPolicy;
use cellwatch_bridge::transport::{
    parse_mqtt_endpoint, validate_loopback_addr, validate_loopback_url, TlsMaterials,
};
use cellwatch_bridge::Bridge;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bridge a USB-tethered cellular monitor to MQTT with Home Assistant discovery"
)]
struct Args {
    /// Monitor status base URL, reachable through the USB port forward.
    #[arg(long, env = "CELLWATCH_BASE", default_value = "http://127.0.0.1:18080")]
    base_url: String,

    /// Allow a non-loopback device URL.
    /// The port forward normally lands on loopback; only override this when
    /// the monitor is genuinely reachable over the network.
    #[arg(long, env = "ALLOW_REMOTE_DEVICE")]
    allow_remote_device: bool,

    /// Poll interval in seconds.
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 3)]
    poll_interval: u64,

    /// Per-attempt HTTP timeout in seconds.
    #[arg(long, env = "HTTP_TIMEOUT", default_value_t = 3.0)]
    http_timeout: f64,

    /// Extra HTTP attempts after the first one.
    #[arg(long, env = "HTTP_RETRIES", default_value_t = 3)]
    http_retries: u32,

    /// Backoff before the first HTTP retry, in seconds; doubles per attempt.
    #[arg(long, env = "HTTP_BACKOFF_BASE", default_value_t = 0.4)]
    http_backoff_base: f64,

    /// Alert on warning-count increases instead of any nonzero count.
    #[arg(long, env = "ALERT_ON_NEW")]
    alert_on_new: bool,

    /// Hold the alert active for this many seconds after a change (0 = off).
    #[arg(long, env = "FORCE_ALERT_SECS", default_value_t = 0)]
    force_alert_secs: u64,

    /// Clear a stale alert after this many seconds without changes (0 = off).
    #[arg(long, env = "AUTOCLEAR_SECS", default_value_t = 0)]
    autoclear_secs: u64,

    /// Poll failures in a row before the device is marked offline.
    #[arg(long, env = "OFFLINE_AFTER_FAILURES", default_value_t = 3)]
    offline_after_failures: u32,

    /// MQTT broker address.
    /// By default, only loopback addresses are allowed for security.
    /// Use --allow-remote-mqtt for trusted local network (e.g., Home Assistant).
    #[arg(long, env = "MQTT_BROKER_ADDR", default_value = "127.0.0.1:1883")]
    mqtt_broker_addr: String,

    /// Allow non-loopback MQTT connections.
    /// ONLY use this in trusted environments like Home Assistant where the
    /// MQTT broker (e.g., core-mosquitto) runs on a separate container.
    #[arg(long, env = "ALLOW_REMOTE_MQTT")]
    allow_remote_mqtt: bool,

    /// MQTT username for authentication.
    /// Required if your broker (like HA Mosquitto) requires authentication.
    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    /// MQTT password for authentication.
    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// MQTT QoS for all publishes (0, 1 or 2).
    #[arg(long, env = "MQTT_QOS", default_value_t = 1)]
    mqtt_qos: u8,

    /// Do not set the retain flag on state topic publishes.
    #[arg(long, env = "MQTT_NO_RETAIN")]
    mqtt_no_retain: bool,

    /// Enable TLS for MQTT (required for mqtts:// brokers).
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Path to a PEM-encoded CA certificate to trust for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,

    /// Path to a PEM-encoded client certificate for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_CERT_PATH")]
    mqtt_tls_client_cert_path: Option<PathBuf>,

    /// Path to a PEM-encoded client private key for MQTT TLS.
    #[arg(long, env = "MQTT_TLS_CLIENT_KEY_PATH")]
    mqtt_tls_client_key_path: Option<PathBuf>,

    /// MQTT client identifier (default: <device-id>_bridge).
    #[arg(long, env = "MQTT_CLIENT_ID")]
    mqtt_client_id: Option<String>,

    /// Device identifier used in topics and unique ids.
    #[arg(long, env = "DEVICE_ID", default_value = "cellwatch_usb")]
    device_id: String,

    /// Device name shown in Home Assistant.
    #[arg(long, env = "DEVICE_NAME", default_value = "Cellwatch (USB)")]
    device_name: String,

    /// Home Assistant MQTT discovery prefix.
    #[arg(long, env = "DISCOVERY_PREFIX", default_value = "homeassistant")]
    discovery_prefix: String,

    /// Suffix of the availability topic under the device topic root.
    #[arg(long, env = "AVAIL_TOPIC_SUFFIX", default_value = "availability")]
    avail_topic_suffix: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mqtt_endpoint = parse_mqtt_endpoint(&args.mqtt_broker_addr, args.mqtt_use_tls)?;
    if !args.allow_remote_mqtt {
        validate_loopback_addr(&mqtt_endpoint, &args.mqtt_broker_addr)?;
    } else {
        log::warn!("Remote MQTT enabled - ensure broker is in a trusted network");
    }
    if !args.allow_remote_device {
        validate_loopback_url(&args.base_url)?;
    } else {
        log::warn!("Remote device URL enabled - the USB port forward normally lands on loopback");
    }

    let tls = TlsMaterials::load(
        args.mqtt_tls_ca_path.as_ref(),
        args.mqtt_tls_client_cert_path.as_ref(),
        args.mqtt_tls_client_key_path.as_ref(),
    )?;

    let poll_interval = Duration::from_secs(args.poll_interval);
    let config = BridgeConfig {
        poll_interval,
        offline_after_failures: args.offline_after_failures,
        poller: PollerConfig {
            base_url: args.base_url.clone(),
            timeout: duration_secs(args.http_timeout, "HTTP_TIMEOUT")?,
            retries: args.http_retries,
            backoff_base: duration_secs(args.http_backoff_base, "HTTP_BACKOFF_BASE")?,
        },
        policy: AlertPolicy {
            alert_on_new: args.alert_on_new,
            force_alert_secs: args.force_alert_secs,
            autoclear_secs: args.autoclear_secs,
        },
        identity: DeviceIdentity {
            device_id: args.device_id.clone(),
            device_name: args.device_name.clone(),
            discovery_prefix: args.discovery_prefix.clone(),
            availability_suffix: args.avail_topic_suffix.clone(),
        },
        mqtt: MqttSettings {
            endpoint: mqtt_endpoint,
            tls,
            client_id: args
                .mqtt_client_id
                .clone()
                .unwrap_or_else(|| format!("{}_bridge", args.device_id)),
            username: args.mqtt_username.clone(),
            password: args.mqtt_password.clone(),
            qos: args.mqtt_qos,
            retain: !args.mqtt_no_retain,
            keep_alive: default_keep_alive(poll_interval),
        },
    };
    config.validate()?;

    log::info!("cellwatch bridge starting");
    log::info!("  device: {} at {}", config.identity.device_id, args.base_url);
    log::info!(
        "  MQTT broker: {}:{} (TLS: {}, auth: {})",
        config.mqtt.endpoint.host,
        config.mqtt.endpoint.port,
        config.mqtt.endpoint.use_tls,
        config.mqtt.username.is_some()
    );
    log::info!("  discovery prefix: {}", config.identity.discovery_prefix);
    log::info!(
        "  poll every {}s, offline after {} failures",
        args.poll_interval,
        args.offline_after_failures
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("error setting Ctrl-C handler");
    }

    let triggers = start_stdin_trigger();

    let bridge = Bridge::new(config, shutdown, triggers).context("start bridge")?;
    bridge.run()
}

fn duration_secs(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow!("{} must be a positive number of seconds", what))
}

/// When attached to a terminal, every stdin line raises a synthetic alert.
/// Handy for checking the Home Assistant side without waiting for the
/// monitor to see something real.
fn start_stdin_trigger() -> Option<mpsc::Receiver<()>> {
    if !std::io::stdin().is_terminal() {
        return None;
    }
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() || tx.send(()).is_err() {
                break;
            }
        }
    });
    log::info!("stdin trigger armed (TTY): press Enter to raise a synthetic alert");
    Some(rx)
}
