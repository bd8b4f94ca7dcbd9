use std::time::Instant;

/// Whether an entry's TTL (if any) has passed `now`.
#[must_use]
pub fn is_expired(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_some_and(|at| now >= at)
}
