//! Telemetry poller: fetches the latest entry of every monitored channel on a
//! fixed tick and keeps the last good reading per channel.
//!
//! ## Per-channel cycle
//!
//! ```text
//! Idle ──[tick]──▶ Fetching ──[entry parsed]──▶ Idle   (reading replaced)
//!                      │
//!                      └──[error / empty]─────▶ Idle   (reading kept)
//! ```
//!
//! Every channel is fetched on its own task. A failing channel only bumps
//! its health counters; its last reading and every other channel's state
//! stay as they were.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, PollerConfig};
use crate::controller::ActuatorController;
use crate::crop::{self, CropSuggestion};
use crate::feed::{ChannelKind, Reading};
use crate::remote::{RemoteError, RemoteStore};
use crate::state::SharedEvents;

// ---------------------------------------------------------------------------
// Channel state
// ---------------------------------------------------------------------------

/// Last good data of one monitored channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub name: String,
    pub kind: ChannelKind,
    pub reading: Option<Reading>,
    /// Only for nutrient channels; follows every new reading.
    pub suggestion: Option<CropSuggestion>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub succeeded: usize,
    pub failed: usize,
}

struct Telemetry {
    channels: Vec<ChannelState>,
    health: Vec<ChannelHealth>,
    polling: bool,
}

impl Telemetry {
    fn new(channels: &[ChannelConfig]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|c| ChannelState {
                    name: c.name.clone(),
                    kind: c.kind,
                    reading: None,
                    suggestion: None,
                    last_success: None,
                })
                .collect(),
            health: vec![ChannelHealth::default(); channels.len()],
            polling: false,
        }
    }

    /// Replace the reading of channel `index`. Returns whether the entry is
    /// new (the store had not produced it on an earlier poll).
    fn commit(&mut self, index: usize, reading: Reading, suggestion: Option<CropSuggestion>) -> bool {
        let Some(state) = self.channels.get_mut(index) else {
            return false;
        };
        let is_new = state.reading.as_ref().map(|r| r.entry_id) != Some(reading.entry_id);

        state.reading = Some(reading);
        state.suggestion = suggestion;
        state.last_success = Some(OffsetDateTime::now_utc());
        if let Some(health) = self.health.get_mut(index) {
            *health = ChannelHealth::default();
        }
        is_new
    }

    fn record_failure(&mut self, index: usize, err: &RemoteError) {
        if let Some(health) = self.health.get_mut(index) {
            health.consecutive_failures += 1;
            health.last_error = Some(err.to_string());
            health.last_failure = Some(OffsetDateTime::now_utc());
        }
    }
}

// ---------------------------------------------------------------------------
// Read-only view
// ---------------------------------------------------------------------------

/// Read access to the poller's state. Cloning is cheap.
#[derive(Clone)]
pub struct TelemetryView {
    inner: Arc<RwLock<Telemetry>>,
}

impl TelemetryView {
    pub async fn channel(&self, name: &str) -> Option<ChannelState> {
        let t = self.inner.read().await;
        t.channels.iter().find(|c| c.name == name).cloned()
    }

    pub async fn health(&self, name: &str) -> Option<ChannelHealth> {
        let t = self.inner.read().await;
        let index = t.channels.iter().position(|c| c.name == name)?;
        t.health.get(index).cloned()
    }

    /// Channels paired with their health, in configuration order.
    pub async fn entries(&self) -> Vec<(ChannelState, ChannelHealth)> {
        let t = self.inner.read().await;
        t.channels
            .iter()
            .cloned()
            .zip(t.health.iter().cloned())
            .collect()
    }

    pub async fn has_any_reading(&self) -> bool {
        let t = self.inner.read().await;
        t.channels.iter().any(|c| c.reading.is_some())
    }

    pub async fn is_polling(&self) -> bool {
        self.inner.read().await.polling
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub struct Poller {
    remote: Arc<dyn RemoteStore>,
    channels: Vec<ChannelConfig>,
    interval: Duration,
    telemetry: Arc<RwLock<Telemetry>>,
    events: SharedEvents,
    controller: Option<Arc<ActuatorController>>,
}

impl Poller {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        channels: Vec<ChannelConfig>,
        cfg: PollerConfig,
        events: SharedEvents,
    ) -> Self {
        let telemetry = Arc::new(RwLock::new(Telemetry::new(&channels)));
        Self {
            remote,
            channels,
            interval: Duration::from_secs(cfg.interval_secs),
            telemetry,
            events,
            controller: None,
        }
    }

    /// Also refresh the actuator status on every tick.
    pub fn with_controller(mut self, controller: Arc<ActuatorController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn view(&self) -> TelemetryView {
        TelemetryView {
            inner: Arc::clone(&self.telemetry),
        }
    }

    /// Fetch every channel once, concurrently, and wait for all of them.
    pub async fn poll_once(&self) -> PollSummary {
        self.telemetry.write().await.polling = true;

        let mut tasks = JoinSet::new();
        for (index, channel) in self.channels.iter().cloned().enumerate() {
            let remote = Arc::clone(&self.remote);
            let telemetry = Arc::clone(&self.telemetry);
            let events = Arc::clone(&self.events);
            tasks.spawn(poll_channel(index, channel, remote, telemetry, events));
        }

        let status = self.controller.as_ref().map(|ctl| {
            let ctl = Arc::clone(ctl);
            tokio::spawn(async move { ctl.refresh_status().await })
        });

        let mut summary = PollSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => summary.succeeded += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    error!("channel poll task failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        if let Some(status) = status {
            match status.await {
                Ok(Ok(applied)) => debug!(applied, "actuator status refreshed"),
                Ok(Err(e)) => warn!("actuator status refresh failed: {e}"),
                Err(e) => error!("actuator status task failed: {e}"),
            }
        }

        self.telemetry.write().await.polling = false;
        summary
    }

    /// Poll on a fixed interval until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            channels = self.channels.len(),
            interval_secs = self.interval.as_secs(),
            "poller started"
        );
        self.events.write().await.record_system(format!(
            "poller started ({} channel(s), every {}s)",
            self.channels.len(),
            self.interval.as_secs()
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.poll_once().await;
                    debug!(succeeded = summary.succeeded, failed = summary.failed, "poll tick complete");
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("poller stopped");
    }
}

async fn poll_channel(
    index: usize,
    channel: ChannelConfig,
    remote: Arc<dyn RemoteStore>,
    telemetry: Arc<RwLock<Telemetry>>,
    events: SharedEvents,
) -> bool {
    let result = remote
        .read_feeds(&channel.channel_id, channel.read_api_key.as_deref(), 1)
        .await
        .and_then(|page| page.feeds.into_iter().next().ok_or(RemoteError::Empty));

    match result {
        Ok(feed) => {
            let reading = feed.reading(&channel.name, channel.kind, channel.field);
            let suggestion = reading.npk().map(|npk| crop::suggest_npk(&npk));
            let detail = describe(&reading, suggestion);

            let is_new = telemetry.write().await.commit(index, reading, suggestion);
            if is_new {
                debug!(channel = %channel.name, "new reading");
                events.write().await.record_reading(detail);
            }
            true
        }
        Err(e) => {
            warn!(channel = %channel.name, "telemetry poll failed, keeping last reading: {e}");
            telemetry.write().await.record_failure(index, &e);
            events
                .write()
                .await
                .record_error(format!("{}: {e}", channel.name));
            false
        }
    }
}

fn describe(reading: &Reading, suggestion: Option<CropSuggestion>) -> String {
    let values = reading
        .kind
        .labels()
        .iter()
        .zip(&reading.values)
        .map(|(label, v)| format!("{label}={v}"))
        .collect::<Vec<_>>()
        .join(", ");
    match suggestion {
        Some(crop) => format!("{}: {values} -> {crop}", reading.channel),
        None => format!("{}: {values}", reading.channel),
    }
}

/// Fetch the last `results` entries of a channel as readings, oldest first.
/// Nothing is stored.
pub async fn fetch_history(
    remote: &dyn RemoteStore,
    channel: &ChannelConfig,
    results: u32,
) -> Result<Vec<Reading>, RemoteError> {
    let page = remote
        .read_feeds(&channel.channel_id, channel.read_api_key.as_deref(), results)
        .await?;
    Ok(page
        .feeds
        .iter()
        .map(|feed| feed.reading(&channel.name, channel.kind, channel.field))
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================
