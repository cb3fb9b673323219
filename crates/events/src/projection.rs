use crate::Event;

/// A projection builds a read model from the committed event log.
///
/// Projections implement the **CQRS read model pattern**: they transform
/// events (write model) into queryable state (read model). Read models are
/// **disposable** and can be rebuilt from the store at any time.
///
/// ## Idempotency
///
/// Events reach projections at least once (replay and live delivery overlap),
/// so `apply` must tolerate redelivery. The [`crate::ProjectionRunner`] helps by
/// tracking the last applied global sequence and skipping anything at or below
/// it.
///
/// ## Error Handling
///
/// `apply` doesn't return errors. An event that is irrelevant to the projection
/// is simply ignored.
pub trait Projection {
    fn apply(&mut self, event: &Event);
}
