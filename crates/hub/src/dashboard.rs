//! Read-only view model served to the dashboard client.

use serde::Serialize;
use time::OffsetDateTime;

use crate::controller::{ActuatorBelief, ActuatorController, LockoutWindow, Phase};
use crate::crop::CropSuggestion;
use crate::feed::ChannelKind;
use crate::poller::{ChannelHealth, ChannelState, TelemetryView};
use crate::state::{SharedEvents, SystemEvent};

#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub uptime_secs: u64,
    /// No channel has produced a reading yet.
    pub loading: bool,
    /// A poll tick is in flight.
    pub polling: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub channels: Vec<ChannelView>,
    pub actuators: ActuatorsView,
    pub lockout: LockoutWindow,
    pub writing: bool,
    pub events: Vec<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub name: String,
    pub kind: ChannelKind,
    pub values: Vec<LabelledValue>,
    pub entry_id: Option<u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    pub suggestion: Option<SuggestionView>,
    pub health: ChannelHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelledValue {
    pub label: &'static str,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuggestionView {
    pub id: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActuatorsView {
    pub motor: ActuatorBelief,
    pub fertilizer: ActuatorBelief,
}

impl DashboardView {
    pub async fn build(
        telemetry: &TelemetryView,
        controller: &ActuatorController,
        events: &SharedEvents,
        started_at: OffsetDateTime,
    ) -> Self {
        let entries = telemetry.entries().await;
        let last_updated = entries.iter().filter_map(|(c, _)| c.last_success).max();
        let loading = !telemetry.has_any_reading().await;
        let polling = telemetry.is_polling().await;
        let actuator = controller.snapshot().await;
        let events = events.read().await.recent();

        let uptime = OffsetDateTime::now_utc() - started_at;

        Self {
            uptime_secs: uptime.whole_seconds().max(0) as u64,
            loading,
            polling,
            last_updated,
            channels: entries.into_iter().map(channel_view).collect(),
            actuators: ActuatorsView {
                motor: actuator.motor,
                fertilizer: actuator.fertilizer,
            },
            lockout: actuator.lockout,
            writing: actuator.phase == Phase::Writing,
            events,
        }
    }
}

fn channel_view((state, health): (ChannelState, ChannelHealth)) -> ChannelView {
    let labels = state.kind.labels();
    let (values, entry_id, recorded_at) = match &state.reading {
        Some(r) => (
            labels
                .iter()
                .zip(&r.values)
                .map(|(label, value)| LabelledValue {
                    label: *label,
                    value: *value,
                })
                .collect(),
            r.entry_id,
            Some(r.recorded_at),
        ),
        None => (Vec::new(), None, None),
    };

    ChannelView {
        name: state.name,
        kind: state.kind,
        values,
        entry_id,
        recorded_at,
        last_success: state.last_success,
        suggestion: state.suggestion.map(suggestion_view),
        health,
    }
}

fn suggestion_view(crop: CropSuggestion) -> SuggestionView {
    SuggestionView {
        id: crop.id(),
        description: crop.description(),
    }
}
