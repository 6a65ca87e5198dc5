use thiserror::Error;

/// The errors a misconfigured [`CacheBuilder`](crate::CacheBuilder)
/// reports from `try_build`. `build` panics with the same messages.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// A count bound and a weigher were both supplied. Weighing only
    /// makes sense with `max_weight`.
    #[error("`max_capacity` cannot be combined with a weigher; use `max_weight` instead")]
    WeigherWithMaxCapacity,

    /// `max_weight` needs a weigher to measure entries with.
    #[error("`max_weight` requires a weigher")]
    MissingWeigher,

    /// `max_capacity` and `max_weight` are mutually exclusive bounds.
    #[error("`max_capacity` and `max_weight` cannot both be set")]
    ConflictingBounds,

    /// `refresh_after_write` reloads entries through the loader, so one
    /// must be supplied.
    #[error("`refresh_after_write` requires a loader")]
    MissingLoader,

    /// A zero-length expiration or refresh interval.
    #[error("the duration for `{0}` must be positive")]
    ZeroDuration(&'static str),
}
