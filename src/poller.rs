//! HTTP status poller for the monitor's loopback API.
//!
//! One `fetch()` per bridge tick. Each endpoint request gets up to
//! `retries + 1` attempts with capped exponential backoff between them;
//! every outcome is a typed [`PollResult`], never a panic or a raw error.
//!
//! Endpoints, best effort:
//! - `/api/system-stats`          -> warning count + last report id (preferred)
//! - `/api/capture-manifest`      -> list of analyses (fallback)
//! - `/api/analysis-report/<id>`  -> full report (fallback for the count)

use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::sleep_interruptible;

pub const STATS_PATH: &str = "/api/system-stats";
pub const MANIFEST_PATH: &str = "/api/capture-manifest";
pub const REPORT_PATH: &str = "/api/analysis-report";

/// Backoff never sleeps longer than this, jitter included.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

const WARNING_KEYS: &[&str] = &["warningCount", "warnings", "warning_count"];
const REPORT_ID_KEYS: &[&str] = &["lastReportId", "last_report_id", "last_id"];
const ENTRY_ID_KEYS: &[&str] = &["id", "report_id", "reportId", "uid"];
const ENTRY_WARNING_KEYS: &[&str] = &["warnings", "warning_count", "num_warnings", "warningTotal"];

/// Why a poll attempt (or the whole poll) failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The request timed out.
    Timeout,
    /// DNS, connect or read failure. Expected while the USB tunnel is down.
    ConnectionError,
    /// The device answered with a non-2xx status.
    HttpStatus(u16),
    /// The device answered 2xx but the body was unusable. Not retried;
    /// the endpoint is reachable, asking again will not fix the payload.
    ParseError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::HttpStatus(code) => write!(f, "http status {}", code),
            Self::ParseError => write!(f, "parse error"),
        }
    }
}

/// Outcome of one bridge tick's poll.
#[derive(Clone, Debug)]
pub enum PollResult {
    Success {
        warning_count: u32,
        report_id: Option<String>,
        raw: Value,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

/// Immutable poller settings, injected at construction.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Device base URL, e.g. `http://127.0.0.1:18080`.
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Extra attempts after the first one.
    pub retries: u32,
    /// Backoff for the first retry; doubles per attempt.
    pub backoff_base: Duration,
}

pub struct StatusPoller {
    config: PollerConfig,
    base_url: String,
    agent: ureq::Agent,
    shutdown: Arc<AtomicBool>,
}

impl StatusPoller {
    pub fn new(config: PollerConfig, shutdown: Arc<AtomicBool>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(config.timeout)
            .user_agent(concat!("cellwatch-bridge/", env!("CARGO_PKG_VERSION")))
            .build();
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            config,
            base_url,
            agent,
            shutdown,
        }
    }

    /// Poll the device once. Consumes all configured retries internally,
    /// so one call maps to exactly one [`PollResult`] for the state machine.
    pub fn fetch(&self) -> PollResult {
        let raw = match self.get_json(STATS_PATH) {
            Ok(value) => value,
            Err((kind, message)) => return PollResult::Failure { kind, message },
        };

        let fields = parse_system_stats(&raw);
        let (warning_count, report_id) = match (fields.warning_count, fields.report_id) {
            (Some(count), id @ Some(_)) => (count, id),
            // Older firmware omits the fields from system-stats; try the
            // capture manifest before declaring the payload unusable.
            (count, id) => match self.fetch_fallback() {
                Some((fallback_count, fallback_id)) => {
                    (count.unwrap_or(fallback_count), id.or(fallback_id))
                }
                None => match count {
                    Some(count) => (count, id),
                    None => {
                        return PollResult::Failure {
                            kind: FailureKind::ParseError,
                            message: format!(
                                "{} is missing a warning count and the manifest fallback produced none",
                                STATS_PATH
                            ),
                        }
                    }
                },
            },
        };

        PollResult::Success {
            warning_count,
            report_id,
            raw,
        }
    }

    /// Recover (warning_count, report_id) from the capture manifest, and if
    /// the newest entry carries no warning total, from its full report.
    fn fetch_fallback(&self) -> Option<(u32, Option<String>)> {
        let manifest = match self.get_json(MANIFEST_PATH) {
            Ok(manifest) => manifest,
            Err((kind, message)) => {
                log::debug!("manifest fallback failed ({}): {}", kind, message);
                return None;
            }
        };
        let (entry, report_id) = newest_manifest_entry(&manifest)?;
        if let Some(total) = entry_warning_total(entry) {
            return Some((total, report_id));
        }
        let id = report_id?;
        match self.get_json(&format!("{}/{}", REPORT_PATH, id)) {
            Ok(report) => Some((count_report_warnings(&report), Some(id))),
            Err((kind, message)) => {
                log::debug!("analysis report fallback failed ({}): {}", kind, message);
                None
            }
        }
    }

    /// Bounded-retry GET returning parsed JSON or the last failure.
    /// A 2xx response with an invalid body returns immediately as
    /// `ParseError`; transport and status failures are retried.
    fn get_json(&self, path: &str) -> Result<Value, (FailureKind, String)> {
        let url = format!("{}{}", self.base_url, path);
        let mut last = (
            FailureKind::ConnectionError,
            format!("{}: no attempt completed", url),
        );
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                self.backoff_sleep(attempt - 1);
                if self.shutdown.load(Ordering::Relaxed) {
                    return Err(last);
                }
            }
            match self.agent.get(&url).call() {
                Ok(response) => {
                    let body = match response.into_string() {
                        Ok(body) => body,
                        Err(e) => {
                            last = (
                                FailureKind::ConnectionError,
                                format!("{}: failed to read body: {}", url, e),
                            );
                            continue;
                        }
                    };
                    return serde_json::from_str(&body).map_err(|e| {
                        (
                            FailureKind::ParseError,
                            format!("{}: invalid JSON: {}", url, e),
                        )
                    });
                }
                Err(ureq::Error::Status(code, _)) => {
                    last = (
                        FailureKind::HttpStatus(code),
                        format!("{}: HTTP {}", url, code),
                    );
                }
                Err(ureq::Error::Transport(transport)) => {
                    last = classify_transport(&transport, &url);
                }
            }
        }
        Err(last)
    }

    fn backoff_sleep(&self, attempt_index: u32) {
        let base = backoff_delay(self.config.backoff_base, attempt_index);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..0.5));
        let delay = (base + jitter).min(BACKOFF_CAP);
        sleep_interruptible(&self.shutdown, delay);
    }
}

/// `base * 2^attempt_index`, capped. Jitter is added by the caller.
fn backoff_delay(base: Duration, attempt_index: u32) -> Duration {
    base.saturating_mul(1u32 << attempt_index.min(16)).min(BACKOFF_CAP)
}

fn classify_transport(transport: &ureq::Transport, url: &str) -> (FailureKind, String) {
    let message = transport.to_string();
    let kind = match transport.kind() {
        ureq::ErrorKind::Dns
        | ureq::ErrorKind::ConnectionFailed
        | ureq::ErrorKind::ProxyConnect => FailureKind::ConnectionError,
        ureq::ErrorKind::Io => {
            let lower = message.to_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") {
                FailureKind::Timeout
            } else {
                FailureKind::ConnectionError
            }
        }
        _ => FailureKind::ConnectionError,
    };
    (kind, format!("{}: {}", url, message))
}

/// Fields of interest in a system-stats document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsFields {
    pub warning_count: Option<u32>,
    pub report_id: Option<String>,
}

/// Extract the warning count and report id from a system-stats document,
/// accepting the field spellings seen across firmware versions.
pub fn parse_system_stats(value: &Value) -> StatsFields {
    StatsFields {
        warning_count: lookup(value, WARNING_KEYS).and_then(coerce_count),
        report_id: lookup(value, REPORT_ID_KEYS).and_then(coerce_id),
    }
}

fn lookup<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let map = value.as_object()?;
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|v| !v.is_null())
}

/// Counts arrive as numbers or numeric strings; negatives clamp to zero.
fn coerce_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(|i| i.max(0) as u32)
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u32)),
        Value::String(s) => s.trim().parse::<i64>().ok().map(|i| i.max(0) as u32),
        _ => None,
    }
}

/// Report ids arrive as strings or integers; normalized to a string.
fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Pick the newest manifest entry, preferring the highest numeric id and
/// falling back to the last entry in document order.
pub fn newest_manifest_entry(manifest: &Value) -> Option<(&Value, Option<String>)> {
    let entries = manifest.as_array()?;
    let mut best: Option<(&Value, i64)> = None;
    for entry in entries {
        if let Some(id) = entry_numeric_id(entry) {
            if best.map_or(true, |(_, best_id)| id > best_id) {
                best = Some((entry, id));
            }
        }
    }
    if let Some((entry, id)) = best {
        return Some((entry, Some(id.to_string())));
    }
    let last = entries.last()?;
    if !last.is_object() {
        return None;
    }
    Some((last, entry_raw_id(last)))
}

fn entry_numeric_id(entry: &Value) -> Option<i64> {
    let map = entry.as_object()?;
    ENTRY_ID_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
}

fn entry_raw_id(entry: &Value) -> Option<String> {
    let map = entry.as_object()?;
    ENTRY_ID_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(coerce_id)
}

/// Warning total carried directly on a manifest entry, if any.
pub fn entry_warning_total(entry: &Value) -> Option<u32> {
    let map = entry.as_object()?;
    ENTRY_WARNING_KEYS
        .iter()
        .filter_map(|key| map.get(*key))
        .find_map(coerce_count)
}

/// Warning total of a full analysis report: a known top-level key when
/// present, otherwise a walk counting warn/critical severity markers.
pub fn count_report_warnings(report: &Value) -> u32 {
    for key in ENTRY_WARNING_KEYS {
        if let Some(count) = report.get(key).and_then(coerce_count) {
            return count;
        }
    }
    count_severity_markers(report)
}

fn count_severity_markers(value: &Value) -> u32 {
    match value {
        Value::Object(map) => {
            let nested: u32 = map.values().map(count_severity_markers).sum();
            let flagged = map.iter().any(|(key, v)| {
                matches!(key.to_lowercase().as_str(), "severity" | "level" | "type" | "class")
                    && v.as_str().map_or(false, |s| {
                        let s = s.to_lowercase();
                        s.contains("warn") || s.contains("critical")
                    })
            });
            nested + u32::from(flagged)
        }
        Value::Array(items) => items.iter().map(count_severity_markers).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stats_accept_camel_case_fields() {
        let fields = parse_system_stats(&json!({"warningCount": 3, "lastReportId": "r-17"}));
        assert_eq!(fields.warning_count, Some(3));
        assert_eq!(fields.report_id, Some("r-17".to_string()));
    }

    #[test]
    fn stats_accept_snake_case_and_short_aliases() {
        let fields = parse_system_stats(&json!({"warning_count": 0, "last_id": 42}));
        assert_eq!(fields.warning_count, Some(0));
        assert_eq!(fields.report_id, Some("42".to_string()));

        let fields = parse_system_stats(&json!({"warnings": "5", "last_report_id": "abc"}));
        assert_eq!(fields.warning_count, Some(5));
        assert_eq!(fields.report_id, Some("abc".to_string()));
    }

    #[test]
    fn stats_null_fields_fall_through_to_aliases() {
        let fields = parse_system_stats(&json!({"warningCount": null, "warnings": 2}));
        assert_eq!(fields.warning_count, Some(2));
    }

    #[test]
    fn stats_negative_count_clamps_to_zero() {
        let fields = parse_system_stats(&json!({"warnings": -4}));
        assert_eq!(fields.warning_count, Some(0));
    }

    #[test]
    fn stats_missing_fields_are_none() {
        let fields = parse_system_stats(&json!({"uptime": 12345}));
        assert_eq!(fields, StatsFields::default());

        let fields = parse_system_stats(&json!([1, 2, 3]));
        assert_eq!(fields, StatsFields::default());
    }

    #[test]
    fn newest_entry_prefers_highest_numeric_id() {
        let manifest = json!([
            {"id": 3, "warnings": 1},
            {"id": 11, "warnings": 0},
            {"id": 7, "warnings": 2}
        ]);
        let (entry, id) = newest_manifest_entry(&manifest).unwrap();
        assert_eq!(id, Some("11".to_string()));
        assert_eq!(entry_warning_total(entry), Some(0));
    }

    #[test]
    fn newest_entry_falls_back_to_last_without_numeric_ids() {
        let manifest = json!([
            {"uid": "a", "warnings": 1},
            {"uid": "b", "warnings": 4}
        ]);
        let (entry, id) = newest_manifest_entry(&manifest).unwrap();
        assert_eq!(id, Some("b".to_string()));
        assert_eq!(entry_warning_total(entry), Some(4));
    }

    #[test]
    fn newest_entry_handles_empty_or_non_list() {
        assert!(newest_manifest_entry(&json!([])).is_none());
        assert!(newest_manifest_entry(&json!({"not": "a list"})).is_none());
    }

    #[test]
    fn report_warnings_prefer_known_keys() {
        assert_eq!(count_report_warnings(&json!({"warnings": 6})), 6);
        assert_eq!(count_report_warnings(&json!({"num_warnings": "2"})), 2);
    }

    #[test]
    fn report_warnings_count_severity_markers() {
        let report = json!({
            "analysis": [
                {"severity": "Warning", "detail": "paging anomaly"},
                {"severity": "info", "detail": "cell change"},
                {"nested": {"level": "CRITICAL"}}
            ]
        });
        assert_eq!(count_report_warnings(&report), 2);
    }

    #[test]
    fn report_without_markers_counts_zero() {
        assert_eq!(count_report_warnings(&json!({"analysis": []})), 0);
        assert_eq!(count_report_warnings(&json!("plain text")), 0);
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(400);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1600));
        assert_eq!(backoff_delay(base, 5), BACKOFF_CAP);
        assert_eq!(backoff_delay(base, 31), BACKOFF_CAP);
    }

    #[test]
    fn failure_kind_display_is_stable() {
        assert_eq!(FailureKind::Timeout.to_string(), "timeout");
        assert_eq!(FailureKind::HttpStatus(503).to_string(), "http status 503");
    }
}
