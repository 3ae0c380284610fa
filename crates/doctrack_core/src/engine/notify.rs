//! Notification seam for applied documents.

use crate::model::change::Change;
use crate::model::entity::EntityId;
use log::info;

/// Emitted once per apply that produced a snapshot, even when no field
/// value differed.
#[derive(Debug, Clone, Copy)]
pub struct ChangeApplied<'a> {
    pub entity_id: EntityId,
    pub kind: &'a str,
    /// Most recent change contributing to the applied snapshot.
    pub change: Option<&'a Change>,
    /// Fields whose value on the entity changed.
    pub changed_fields: &'a [String],
}

/// Receiver of [`ChangeApplied`] events.
pub trait ChangeAppliedSink {
    fn change_applied(&self, event: &ChangeApplied<'_>);
}

impl<F> ChangeAppliedSink for F
where
    F: Fn(&ChangeApplied<'_>),
{
    fn change_applied(&self, event: &ChangeApplied<'_>) {
        self(event)
    }
}

/// Sink that writes one structured log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ChangeAppliedSink for LogSink {
    fn change_applied(&self, event: &ChangeApplied<'_>) {
        let change_id = event
            .change
            .map_or_else(|| "none".to_string(), |change| change.id.to_string());
        info!(
            "event=change_applied module=engine status=ok kind={} entity_id={} change_id={} changed_fields={}",
            event.kind,
            event.entity_id,
            change_id,
            event.changed_fields.join(",")
        );
    }
}
