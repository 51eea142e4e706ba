use thiserror::Error;

/// Errors surfaced by the store, allocator and dispatch operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid input: {0}")]
    Validation(String),

    /// A compare-and-swap update lost, or a slot changed between preview
    /// and confirm. The caller decides whether to re-preview or force.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no free slot for page {page_id} within {lookahead_days} days")]
    NoSlotAvailable { page_id: i64, lookahead_days: u32 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}
