//! The tick loop: poll, advance, publish.
//!
//! Phases: `Starting` until the first successful poll, `Polling` while the
//! device answers, `Degraded` once the failure streak crosses the
//! threshold. Degraded only changes logging and the availability topic;
//! polling itself never stops. The loop runs until the shutdown flag flips,
//! then publishes a retained `offline` and disconnects.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use crate::config::BridgeConfig;
use crate::poller::{PollResult, StatusPoller};
use crate::publisher::Publisher;
use crate::state::AlertState;
use crate::{epoch_secs, sleep_interruptible};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Starting,
    Polling,
    Degraded,
}

pub struct Bridge {
    config: BridgeConfig,
    poller: StatusPoller,
    publisher: Publisher,
    state: AlertState,
    phase: Phase,
    shutdown: Arc<AtomicBool>,
    triggers: Option<mpsc::Receiver<()>>,
    last_status_line: String,
}

impl Bridge {
    /// Connect the publisher (will registered first) and wire up the poller.
    pub fn new(
        config: BridgeConfig,
        shutdown: Arc<AtomicBool>,
        triggers: Option<mpsc::Receiver<()>>,
    ) -> Result<Self> {
        let poller = StatusPoller::new(config.poller.clone(), shutdown.clone());
        let publisher = Publisher::connect(&config.mqtt, &config.identity)?;
        Ok(Self {
            config,
            poller,
            publisher,
            state: AlertState::default(),
            phase: Phase::Starting,
            shutdown,
            triggers,
            last_status_line: String::new(),
        })
    }

    /// Run until shutdown. Nothing in the tick path is fatal; broker and
    /// poll failures are logged and retried on the next tick.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            "bridge started (device {}, poll every {}s)",
            self.config.identity.device_id,
            self.config.poll_interval.as_secs()
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick(epoch_secs());
            sleep_interruptible(&self.shutdown, self.config.poll_interval);
        }

        log::info!("shutdown signal received, publishing offline");
        self.publisher.shutdown()
    }

    fn tick(&mut self, now: u64) {
        // A fresh broker connection needs discovery and availability before
        // any state topic makes sense to Home Assistant.
        match self.publisher.ensure_announced() {
            Ok(true) => {
                let online = self.phase != Phase::Degraded;
                if let Err(e) = self.publisher.publish_availability(online) {
                    log::warn!("availability publish failed: {}", e);
                }
            }
            Ok(false) => {}
            Err(e) => log::warn!("discovery publish failed: {}", e),
        }

        let result = self.poller.fetch();
        if let PollResult::Failure { kind, message } = &result {
            log::warn!("poll failed ({}): {}", kind, message);
        }

        let mut next = self.state.advance(&self.config.policy, &result, now);

        if let Some(triggers) = &self.triggers {
            while triggers.try_recv().is_ok() {
                log::info!("synthetic alert trigger received");
                next = next.trigger(now);
            }
        }

        self.apply_phase(&next);

        if let Err(e) = self.publisher.publish_state(&next) {
            log::warn!("state publish failed: {}", e);
        }

        self.log_heartbeat(&next);
        self.state = next;
    }

    fn apply_phase(&mut self, next: &AlertState) {
        let target = next_phase(self.phase, next, self.config.offline_after_failures);
        if target == self.phase {
            return;
        }
        match target {
            Phase::Degraded => {
                log::warn!(
                    "{} consecutive poll failures, marking {} offline",
                    next.consecutive_failures,
                    self.config.identity.device_id
                );
                if let Err(e) = self.publisher.publish_availability(false) {
                    log::warn!("availability publish failed: {}", e);
                }
            }
            Phase::Polling => {
                if self.phase == Phase::Degraded {
                    log::info!(
                        "device reachable again, marking {} online",
                        self.config.identity.device_id
                    );
                    if let Err(e) = self.publisher.publish_availability(true) {
                        log::warn!("availability publish failed: {}", e);
                    }
                }
            }
            Phase::Starting => {}
        }
        self.phase = target;
    }

    /// One compact status line, logged only when it changes.
    fn log_heartbeat(&mut self, next: &AlertState) {
        let line = format!(
            "poll={} last_id={} warnings={} alert={}",
            if next.consecutive_failures == 0 { "ok" } else { "down" },
            next.last_report_id.as_deref().unwrap_or("none"),
            next.warning_count,
            if next.alert_active { "ON" } else { "OFF" }
        );
        if line != self.last_status_line {
            log::info!("{}", line);
            self.last_status_line = line;
        }
    }
}

/// Pure phase derivation so the transition table is testable without I/O.
fn next_phase(current: Phase, state: &AlertState, offline_after_failures: u32) -> Phase {
    if state.is_offline(offline_after_failures) {
        Phase::Degraded
    } else if state.consecutive_failures == 0 && state.last_success_ts.is_some() {
        Phase::Polling
    } else {
        current
    }
}
