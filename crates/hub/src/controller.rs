//! Actuator controller: motor pump and fertilizer doser behind one remote
//! write.
//!
//! The remote channel only accepts a combined update carrying both field
//! values, and refuses any update arriving within the lockout interval of the
//! previous accepted one. The controller keeps the believed state of both
//! actuators, serialises commands and reconciles its belief with the remote
//! status after every accepted write.
//!
//! ## Phases
//!
//! ```text
//!          request (idle only)            accepted
//!  Idle ────────────────────▶ Writing ───────────────▶ LockedOut(n)
//!   ▲                            │                          │
//!   └──── rejected / failed ─────┘                          │ tick: n-1
//!   ▲                                                       │
//!   └────────────────────── n reaches 0 ────────────────────┘
//! ```
//!
//! Requests arriving while `Writing` or `LockedOut` fail immediately and
//! never reach the remote store.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ActuatorConfig;
use crate::feed::Feed;
use crate::remote::{RemoteError, RemoteStore};
use crate::state::SharedEvents;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Motor,
    Fertilizer,
}

/// Where a believed actuator value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeliefSource {
    /// Nothing read yet; the value is the "off" default.
    Unknown,
    /// Confirmed by a status read.
    Remote,
    /// Assumed from a write that has not been confirmed.
    Optimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActuatorBelief {
    pub on: bool,
    pub source: BeliefSource,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ActuatorBelief {
    fn unknown() -> Self {
        Self {
            on: false,
            source: BeliefSource::Unknown,
            updated_at: None,
        }
    }

    fn new(on: bool, source: BeliefSource) -> Self {
        Self {
            on,
            source,
            updated_at: Some(OffsetDateTime::now_utc()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Writing,
    LockedOut { remaining_secs: u32 },
}

/// Remaining lockout as seen by readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockoutWindow {
    pub seconds_remaining: u32,
    pub locked: bool,
}

impl Phase {
    pub fn lockout(self) -> LockoutWindow {
        match self {
            Self::LockedOut { remaining_secs } => LockoutWindow {
                seconds_remaining: remaining_secs,
                locked: true,
            },
            _ => LockoutWindow {
                seconds_remaining: 0,
                locked: false,
            },
        }
    }
}

/// Actuator values as reported by the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorStatus {
    pub motor: bool,
    pub fertilizer: bool,
}

impl ActuatorStatus {
    /// Only the literal `"1"` counts as on.
    pub fn from_feed(feed: &Feed, motor_field: u8, fertilizer_field: u8) -> Self {
        Self {
            motor: feed.field(motor_field) == Some("1"),
            fertilizer: feed.field(fertilizer_field) == Some("1"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub motor: ActuatorBelief,
    pub fertilizer: ActuatorBelief,
    pub phase: Phase,
    pub lockout: LockoutWindow,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub entry_id: String,
    pub motor: bool,
    pub fertilizer: bool,
    /// The post-write status read succeeded and the beliefs are remote-backed.
    pub confirmed: bool,
    pub lockout_secs: u32,
}

/// Why a command did not take effect.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("a command is already being sent")]
    Busy,

    #[error("actuator channel is locked for {remaining_secs}s, try again shortly")]
    LockedOut { remaining_secs: u32 },

    #[error("command rejected by the remote store, try again shortly")]
    Rejected,

    #[error("command not delivered ({0}), try again shortly")]
    Transport(#[from] RemoteError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner {
    motor: ActuatorBelief,
    fertilizer: ActuatorBelief,
    phase: Phase,
    /// Bumped when a write starts and when its confirmation lands.
    epoch: u64,
    /// A write or its confirmatory read is still outstanding.
    reconciling: bool,
    /// End of the current lockout, counted from the accepted write.
    locked_until: Option<Instant>,
}

impl Inner {
    /// Bring a `LockedOut` phase in line with its deadline.
    fn settle_lockout(&mut self, now: Instant) {
        let (Phase::LockedOut { .. }, Some(until)) = (self.phase, self.locked_until) else {
            return;
        };
        let left = until.saturating_duration_since(now);
        if left.is_zero() {
            self.phase = Phase::Idle;
            self.locked_until = None;
            debug!("actuator lockout expired");
        } else {
            self.phase = Phase::LockedOut {
                remaining_secs: whole_secs_up(left),
            };
        }
    }
}

struct PendingWrite {
    motor: bool,
    fertilizer: bool,
    previous: (ActuatorBelief, ActuatorBelief),
    epoch: u64,
}

pub struct ActuatorController {
    remote: Arc<dyn RemoteStore>,
    cfg: ActuatorConfig,
    events: SharedEvents,
    inner: RwLock<Inner>,
    /// Fired on every accepted write so the timer realigns to it.
    lockout_started: Notify,
}

impl ActuatorController {
    pub fn new(remote: Arc<dyn RemoteStore>, cfg: ActuatorConfig, events: SharedEvents) -> Self {
        Self {
            remote,
            cfg,
            events,
            inner: RwLock::new(Inner {
                motor: ActuatorBelief::unknown(),
                fertilizer: ActuatorBelief::unknown(),
                phase: Phase::Idle,
                epoch: 0,
                reconciling: false,
                locked_until: None,
            }),
            lockout_started: Notify::new(),
        }
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        let inner = self.inner.read().await;
        ControllerSnapshot {
            motor: inner.motor,
            fertilizer: inner.fertilizer,
            phase: inner.phase,
            lockout: inner.phase.lockout(),
        }
    }

    /// Send both actuator values in one update.
    pub async fn request_write(
        &self,
        motor: bool,
        fertilizer: bool,
    ) -> Result<WriteOutcome, WriteError> {
        let pending = self.begin_write(|_| (motor, fertilizer)).await?;
        self.dispatch(pending).await
    }

    /// Change one actuator. The other one keeps its current believed value,
    /// read at the moment the write is admitted.
    pub async fn set_actuator(
        &self,
        actuator: Actuator,
        on: bool,
    ) -> Result<WriteOutcome, WriteError> {
        let pending = self
            .begin_write(|inner| match actuator {
                Actuator::Motor => (on, inner.fertilizer.on),
                Actuator::Fertilizer => (inner.motor.on, on),
            })
            .await?;
        self.dispatch(pending).await
    }

    /// Background reconciliation read. Returns whether the result was
    /// applied; it is dropped when a write started or settled meanwhile.
    pub async fn refresh_status(&self) -> Result<bool, RemoteError> {
        let ticket = self.inner.read().await.epoch;
        let status = self.read_status().await?;

        let change = {
            let mut inner = self.inner.write().await;
            if inner.reconciling || inner.epoch != ticket {
                debug!(ticket, epoch = inner.epoch, "discarding superseded status read");
                return Ok(false);
            }
            apply_remote(&mut inner, status)
        };

        if let Some(detail) = change {
            info!(motor = status.motor, fertilizer = status.fertilizer, "actuator status changed remotely");
            self.events.write().await.record_actuator(detail);
        }
        Ok(true)
    }

    /// Advance the lockout countdown. The remaining seconds are measured
    /// against the acceptance deadline, never against the tick count.
    pub async fn tick(&self) -> Phase {
        let mut inner = self.inner.write().await;
        inner.settle_lockout(Instant::now());
        inner.phase
    }

    // -- Write path --------------------------------------------------------

    /// Admit a write if idle. `desired` sees the beliefs under the same lock
    /// that moves the phase to `Writing`.
    async fn begin_write<F>(&self, desired: F) -> Result<PendingWrite, WriteError>
    where
        F: FnOnce(&Inner) -> (bool, bool),
    {
        let mut inner = self.inner.write().await;
        inner.settle_lockout(Instant::now());
        match inner.phase {
            Phase::Writing => return Err(WriteError::Busy),
            Phase::LockedOut { remaining_secs } => {
                return Err(WriteError::LockedOut { remaining_secs })
            }
            Phase::Idle => {}
        }

        let (motor, fertilizer) = desired(&*inner);
        let previous = (inner.motor, inner.fertilizer);

        inner.phase = Phase::Writing;
        inner.epoch += 1;
        inner.reconciling = true;
        inner.motor = ActuatorBelief::new(motor, BeliefSource::Optimistic);
        inner.fertilizer = ActuatorBelief::new(fertilizer, BeliefSource::Optimistic);

        Ok(PendingWrite {
            motor,
            fertilizer,
            previous,
            epoch: inner.epoch,
        })
    }

    async fn dispatch(&self, pending: PendingWrite) -> Result<WriteOutcome, WriteError> {
        let fields = [
            (self.cfg.motor_field, u8::from(pending.motor)),
            (self.cfg.fertilizer_field, u8::from(pending.fertilizer)),
        ];

        info!(
            motor = pending.motor,
            fertilizer = pending.fertilizer,
            "sending actuator command"
        );

        let entry_id = match self.remote.write_fields(&self.cfg.write_api_key, &fields).await {
            Ok(body) if is_accepted(&body) => body.trim().to_string(),
            Ok(body) => {
                warn!(body = %body.trim(), "actuator command rejected");
                self.abort_write(&pending, "command rejected, try again shortly".to_string())
                    .await;
                return Err(WriteError::Rejected);
            }
            Err(e) => {
                warn!("actuator command failed: {e}");
                self.abort_write(&pending, format!("command failed: {e}")).await;
                return Err(WriteError::Transport(e));
            }
        };

        {
            let mut inner = self.inner.write().await;
            inner.phase = Phase::LockedOut {
                remaining_secs: self.cfg.lockout_secs,
            };
            inner.locked_until =
                Some(Instant::now() + Duration::from_secs(u64::from(self.cfg.lockout_secs)));
        }
        self.lockout_started.notify_one();
        info!(
            entry_id = %entry_id,
            lockout_secs = self.cfg.lockout_secs,
            "actuator command accepted"
        );

        let confirmed = self.confirm(&pending).await;
        let snapshot = self.snapshot().await;

        self.events.write().await.record_actuator(format!(
            "command accepted (entry {entry_id}): motor {}, fertilizer {}{}",
            on_off(snapshot.motor.on),
            on_off(snapshot.fertilizer.on),
            if confirmed { "" } else { " (unconfirmed)" }
        ));

        Ok(WriteOutcome {
            entry_id,
            motor: snapshot.motor.on,
            fertilizer: snapshot.fertilizer.on,
            confirmed,
            lockout_secs: self.cfg.lockout_secs,
        })
    }

    /// Post-write status read. Supersedes any background read in flight.
    async fn confirm(&self, pending: &PendingWrite) -> bool {
        let result = self.read_status().await;

        let mut inner = self.inner.write().await;
        if inner.epoch != pending.epoch {
            // A newer write owns the reconciliation now.
            return false;
        }
        inner.reconciling = false;

        match result {
            Ok(status) => {
                apply_remote(&mut inner, status);
                inner.epoch += 1;
                true
            }
            Err(e) => {
                warn!("confirmatory status read failed, keeping assumed state: {e}");
                false
            }
        }
    }

    async fn abort_write(&self, pending: &PendingWrite, detail: String) {
        {
            let mut inner = self.inner.write().await;
            inner.motor = pending.previous.0;
            inner.fertilizer = pending.previous.1;
            inner.phase = Phase::Idle;
            inner.reconciling = false;
        }
        self.events.write().await.record_error(detail);
    }

    async fn read_status(&self) -> Result<ActuatorStatus, RemoteError> {
        let page = self
            .remote
            .read_feeds(&self.cfg.channel_id, self.cfg.read_api_key.as_deref(), 1)
            .await?;
        let feed = page.feeds.first().ok_or(RemoteError::Empty)?;
        Ok(ActuatorStatus::from_feed(
            feed,
            self.cfg.motor_field,
            self.cfg.fertilizer_field,
        ))
    }
}

/// Overwrite both beliefs with a status read. Returns a description when a
/// value actually changed.
fn apply_remote(inner: &mut Inner, status: ActuatorStatus) -> Option<String> {
    let changed = inner.motor.on != status.motor || inner.fertilizer.on != status.fertilizer;
    inner.motor = ActuatorBelief::new(status.motor, BeliefSource::Remote);
    inner.fertilizer = ActuatorBelief::new(status.fertilizer, BeliefSource::Remote);

    changed.then(|| {
        format!(
            "remote status: motor {}, fertilizer {}",
            on_off(status.motor),
            on_off(status.fertilizer)
        )
    })
}

/// The store answers `"0"` when it refuses an update; anything else is the
/// new entry id.
fn is_accepted(body: &str) -> bool {
    body.trim() != "0"
}

fn whole_secs_up(d: Duration) -> u32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Lockout timer
// ---------------------------------------------------------------------------

/// Drive the lockout countdown once per second until shutdown. The schedule
/// restarts at every accepted write so each second is counted in full.
pub async fn run_lockout_timer(
    controller: Arc<ActuatorController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.tick().await;
            }
            _ = controller.lockout_started.notified() => ticker.reset(),
            _ = shutdown.changed() => break,
        }
    }
    debug!("lockout timer stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
