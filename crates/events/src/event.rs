use chrono::{DateTime, Utc};

/// Something that happened to a workflow instance or a stock row, published
/// after its change committed.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted name subscribers route on, such as `stock.movement.posted`.
    fn event_type(&self) -> &'static str;

    /// Payload layout version; bumped when fields change meaning.
    fn version(&self) -> u32;

    /// Commit time of the change.
    fn occurred_at(&self) -> DateTime<Utc>;
}
