//! MQTT endpoint parsing and TLS materials.
//!
//! Compatible with Home Assistant MQTT integration patterns:
//! - CA verification: custom CA path or system roots
//! - Client certificates: mutual TLS support
//! - Insecure mode: disabled by default (HA supports it, we don't)

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::PathBuf;

/// MQTT endpoint with TLS flag.
#[derive(Clone, Debug)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// TLS certificate materials for MQTT connections.
///
/// Mirrors Home Assistant's MQTT TLS configuration:
/// - `ca`: CA cert (like HA's CONF_CERTIFICATE; None = system roots)
/// - `client_auth`: client cert + key for mutual TLS
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes.
    pub ca: Option<Vec<u8>>,

    /// Client certificate and key for mutual TLS.
    /// Both must be provided together (cert, key).
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Load TLS materials from file paths.
    ///
    /// CA path is optional (None = use system roots); client cert and key
    /// must be provided together.
    pub fn load(
        ca_path: Option<&PathBuf>,
        client_cert_path: Option<&PathBuf>,
        client_key_path: Option<&PathBuf>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client cert '{}'",
                        cert_path.display()
                    )
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!(
                        "failed to read MQTT TLS client key '{}'",
                        key_path.display()
                    )
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => {
                return Err(anyhow!("MQTT TLS client certificate provided without key"))
            }
            (None, Some(_)) => {
                return Err(anyhow!("MQTT TLS client key provided without certificate"))
            }
        };

        Ok(Self { ca, client_auth })
    }

    /// Check if any TLS materials are configured.
    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

/// Build a rumqttc Transport for the endpoint.
///
/// # Errors
/// - If TLS materials are provided but TLS is disabled
/// - If client certificates are provided without a CA
pub fn build_transport(endpoint: &MqttEndpoint, materials: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if materials.is_configured() {
            return Err(anyhow!(
                "MQTT TLS materials provided but TLS is disabled.\n\
                 Use --mqtt-use-tls or the mqtts:// scheme to enable TLS."
            ));
        }
        return Ok(Transport::tcp());
    }

    if !materials.is_configured() {
        // System/webpki roots (like HA's "auto" mode)
        return Ok(Transport::tls_with_default_config());
    }

    let ca = materials.ca.clone().ok_or_else(|| {
        anyhow!(
            "MQTT TLS CA certificate is required when providing client certificates.\n\
             Specify --mqtt-tls-ca-path or remove client cert configuration."
        )
    })?;

    Ok(Transport::tls(ca, materials.client_auth.clone(), None))
}

/// Parse MQTT endpoint from an address string.
///
/// Supports formats:
/// - `host:port` (plain TCP or TLS based on tls_override)
/// - `mqtt://host:port` (plain TCP)
/// - `mqtts://host:port` (TLS)
/// - `tcp://host:port` (plain TCP)
/// - `ssl://host:port` (TLS)
/// - `[ipv6]:port` (IPv6 with brackets)
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // IPv6 addresses in brackets: [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}

fn host_is_loopback(host: &str) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return true;
    }
    matches!(host.parse::<std::net::IpAddr>(), Ok(ip) if ip.is_loopback())
}

/// Validate that the broker endpoint is loopback (for security).
pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    if host_is_loopback(&endpoint.host) {
        return Ok(());
    }
    Err(anyhow!(
        "MQTT broker must be loopback for security: {} (use --allow-remote-mqtt to override)",
        original
    ))
}

/// Validate that the device status URL points at loopback.
///
/// The monitor's HTTP port is only reachable through a USB port forward on
/// the local host; a non-loopback URL is almost always a misconfiguration.
pub fn validate_loopback_url(base: &str) -> Result<()> {
    let url = url::Url::parse(base).with_context(|| format!("invalid device URL '{}'", base))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(anyhow!(
                "unsupported device URL scheme '{}'; expected http(s)",
                other
            ))
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("device URL '{}' has no host", base))?;
    if host_is_loopback(host) {
        return Ok(());
    }
    Err(anyhow!(
        "device URL must be loopback: {} (use --allow-remote-device to override)",
        base
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_endpoint_plain() {
        let ep = parse_mqtt_endpoint("127.0.0.1:1883", false).unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1883);
        assert!(!ep.use_tls);
    }

    #[test]
    fn parse_endpoint_mqtts_scheme() {
        let ep = parse_mqtt_endpoint("mqtts://broker.example.com:8883", false).unwrap();
        assert_eq!(ep.host, "broker.example.com");
        assert_eq!(ep.port, 8883);
        assert!(ep.use_tls);
    }

    #[test]
    fn parse_endpoint_tls_override() {
        let ep = parse_mqtt_endpoint("127.0.0.1:8883", true).unwrap();
        assert!(ep.use_tls);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let ep = parse_mqtt_endpoint("[::1]:1883", false).unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_unknown_scheme() {
        assert!(parse_mqtt_endpoint("ws://broker:9001", false).is_err());
        assert!(parse_mqtt_endpoint("nonsense", false).is_err());
    }

    #[test]
    fn validate_loopback_accepts_localhost() {
        let ep = MqttEndpoint {
            host: "localhost".to_string(),
            port: 1883,
            use_tls: false,
        };
        assert!(validate_loopback_addr(&ep, "localhost:1883").is_ok());
    }

    #[test]
    fn validate_loopback_rejects_remote() {
        let ep = MqttEndpoint {
            host: "192.168.1.10".to_string(),
            port: 1883,
            use_tls: false,
        };
        assert!(validate_loopback_addr(&ep, "192.168.1.10:1883").is_err());
    }

    #[test]
    fn device_url_loopback_only() {
        assert!(validate_loopback_url("http://127.0.0.1:18080").is_ok());
        assert!(validate_loopback_url("http://localhost:18080").is_ok());
        assert!(validate_loopback_url("http://10.0.0.5:18080").is_err());
        assert!(validate_loopback_url("ftp://127.0.0.1:18080").is_err());
        assert!(validate_loopback_url("not a url").is_err());
    }

    #[test]
    fn tls_materials_requires_both_cert_and_key() {
        let cert_only =
            TlsMaterials::load(None, Some(&PathBuf::from("/nonexistent/cert.pem")), None);
        assert!(cert_only.is_err());
        assert!(cert_only.unwrap_err().to_string().contains("without key"));

        let key_only = TlsMaterials::load(None, None, Some(&PathBuf::from("/nonexistent/key.pem")));
        assert!(key_only.is_err());
    }

    #[test]
    fn tls_materials_load_reads_files() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();
        let materials = TlsMaterials::load(Some(&ca.path().to_path_buf()), None, None).unwrap();
        assert!(materials.is_configured());
        assert!(materials.ca.unwrap().starts_with(b"-----BEGIN"));
    }

    #[test]
    fn transport_rejects_materials_without_tls() {
        let ep = MqttEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1883,
            use_tls: false,
        };
        let materials = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            client_auth: None,
        };
        assert!(build_transport(&ep, &materials).is_err());
    }

    #[test]
    fn transport_plain_tcp_without_materials() {
        let ep = MqttEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1883,
            use_tls: false,
        };
        assert!(build_transport(&ep, &TlsMaterials::default()).is_ok());
    }
}
