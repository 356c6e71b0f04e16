//! Transport layer for the MQTT side of the bridge.
//!
//! Endpoint parsing, loopback validation for both the broker and the
//! device URL, and TLS material handling for rumqttc connections.

mod tls;

pub use tls::{
    build_transport, parse_mqtt_endpoint, validate_loopback_addr, validate_loopback_url,
    MqttEndpoint, TlsMaterials,
};
