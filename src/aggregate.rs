use crate::event::Event;
use crate::types::SequenceNumber;

/// The user-supplied aggregate contract.
///
/// An aggregate is a consistency boundary identified by its type tag
/// ([`NAME`](Aggregate::NAME)) and its `id`. Its state must be derivable
/// from nothing but `Default::default()` and its event stream: applying the
/// same events, in the same order, must always yield an identical state.
///
/// `apply` is purposefully synchronous and must be pure state mutation:
/// the repository replays through it and performs no other calls on the
/// aggregate, so side effects belong in command handling, never in replay.
pub trait Aggregate: Default + Send + Sync {
    /// Aggregate type tag. Links instances to their events through the
    /// `_aggregate_type` metadata label; changing it breaks that link.
    const NAME: &'static str;

    /// Identity of this instance, recorded as `_aggregate_id` on every
    /// persisted event.
    fn id(&self) -> &str;

    /// Replays one event onto the state, dispatching on `event.name()`.
    /// Unknown event names should be ignored for forward compatibility.
    fn apply(&mut self, event: &Event);

    /// Drains the buffer of events recorded since the last save.
    fn drain_pending_events(&mut self) -> Vec<Event>;

    /// The number of events persisted for this instance.
    fn version(&self) -> SequenceNumber;

    fn set_version(&mut self, version: SequenceNumber);
}
