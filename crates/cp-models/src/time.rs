//! Timestamp helpers

use chrono::{DateTime, Duration, Utc};

/// The "pseudo-zero" timestamp: one nanosecond past the Unix epoch.
///
/// Used as the `updated_at` watermark before the first sync, so that a
/// watermark equal to it means no listing has been observed yet.
pub fn pseudo_zero() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::nanoseconds(1)
}

/// Whether the watermark is still the pseudo-zero sentinel (or older).
pub fn is_pseudo_zero(t: &DateTime<Utc>) -> bool {
    *t <= pseudo_zero()
}
