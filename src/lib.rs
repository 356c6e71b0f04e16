//! Cellwatch bridge
//!
//! Bridges a USB-tethered cellular monitor's loopback HTTP status API to an
//! MQTT broker with Home Assistant discovery. The monitor counts suspicious
//! cellular activity; this crate turns that into a debounced alert entity,
//! a last-report-id sensor and a warning-count sensor, with broker-side
//! liveness via Last Will.
//!
//! # Module Structure
//!
//! - `poller`: bounded-retry HTTP GET with typed failures
//! - `state`: pure alert state transitions (debounce, force, autoclear)
//! - `publisher`: discovery configs, retained state topics, LWT
//! - `bridge`: the tick loop and Starting/Polling/Degraded phases
//! - `config`: immutable startup configuration
//! - `transport`: MQTT endpoint parsing and TLS materials

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub mod bridge;
pub mod config;
pub mod poller;
pub mod publisher;
pub mod state;
pub mod transport;

pub use bridge::Bridge;
pub use config::{BridgeConfig, DeviceIdentity, MqttSettings};
pub use poller::{FailureKind, PollResult, PollerConfig, StatusPoller};
pub use publisher::{PublishedSnapshot, Publisher, Topics};
pub use state::{AlertPolicy, AlertState};

/// Wall clock in epoch seconds. The state machine takes this as an explicit
/// argument; only the bridge loop reads the real clock.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sleep that notices the shutdown flag within a quarter second, so signal
/// latency never depends on the poll interval or a backoff window.
pub fn sleep_interruptible(stop: &AtomicBool, total: Duration) {
    const SLICE: Duration = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}
