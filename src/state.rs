//! Debounced alert state.
//!
//! `advance` is a pure function of `(state, policy, result, now)`; the
//! bridge loop assigns the returned value. Keeping the clock an explicit
//! argument makes the force/autoclear ordering testable without real time.

use crate::poller::PollResult;

/// Alerting rules, fixed at startup.
#[derive(Clone, Copy, Debug)]
pub struct AlertPolicy {
    /// Alert on strict warning-count increases instead of tracking
    /// `warning_count > 0` as a level.
    pub alert_on_new: bool,
    /// Hold the alert active for this long after any change. 0 disables.
    pub force_alert_secs: u64,
    /// Clear the alert this long after the last change. 0 disables.
    /// Loses ties against the force window.
    pub autoclear_secs: u64,
}

/// Everything the bridge knows about the monitor, updated once per tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AlertState {
    /// Last known warning count.
    pub warning_count: u32,
    /// Last known report id; survives polls that could not recover one.
    pub last_report_id: Option<String>,
    pub alert_active: bool,
    /// Epoch seconds of the last warning-count change (or synthetic flip).
    pub last_change_ts: Option<u64>,
    pub last_success_ts: Option<u64>,
    pub consecutive_failures: u32,
}

impl AlertState {
    /// Advance by one poll result. Failures only bump the failure streak;
    /// alert bookkeeping moves on successes alone.
    pub fn advance(&self, policy: &AlertPolicy, result: &PollResult, now: u64) -> AlertState {
        let mut next = self.clone();

        let (warning_count, report_id) = match result {
            PollResult::Failure { .. } => {
                next.consecutive_failures = next.consecutive_failures.saturating_add(1);
                return next;
            }
            PollResult::Success {
                warning_count,
                report_id,
                ..
            } => (*warning_count, report_id.clone()),
        };

        next.consecutive_failures = 0;

        if self.last_success_ts.is_none() {
            // First contact: seed from the level. Arming last_change_ts on a
            // quiet startup would trip the force window, so only an active
            // seed records a change.
            next.alert_active = warning_count > 0;
            if next.alert_active {
                next.last_change_ts = Some(now);
            }
        } else if policy.alert_on_new {
            if warning_count > self.warning_count {
                next.alert_active = true;
                next.last_change_ts = Some(now);
            }
        } else {
            next.alert_active = warning_count > 0;
            if warning_count != self.warning_count {
                next.last_change_ts = Some(now);
            }
        }

        next.last_success_ts = Some(now);
        next.warning_count = warning_count;
        if report_id.is_some() {
            next.last_report_id = report_id;
        }

        // Autoclear first, force second: when both windows apply, force wins.
        if let Some(changed) = next.last_change_ts {
            let since_change = now.saturating_sub(changed);
            if policy.autoclear_secs > 0 && since_change > policy.autoclear_secs {
                next.alert_active = false;
            }
            if policy.force_alert_secs > 0 && since_change <= policy.force_alert_secs {
                next.alert_active = true;
            }
        }

        next
    }

    /// Synthetic trigger (manual test input). Behaves like a real change so
    /// the autoclear window applies to it.
    pub fn trigger(&self, now: u64) -> AlertState {
        let mut next = self.clone();
        next.alert_active = true;
        next.last_change_ts = Some(now);
        next
    }

    /// Availability derivation: offline once the failure streak reaches the
    /// threshold. The alert fields are deliberately not consulted.
    pub fn is_offline(&self, offline_after_failures: u32) -> bool {
        self.consecutive_failures >= offline_after_failures
    }
}
