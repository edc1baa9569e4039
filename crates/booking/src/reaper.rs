use chrono::{DateTime, Utc};
use matchday_db::reservations;
use tracing::{debug, info};

use crate::{Booking, BookingResult};

impl Booking {
    /// Cancels pending reservations whose checkout can no longer be paid,
    /// giving their held seats back. Returns how many were expired.
    ///
    /// A hold is reaped once it is older than the checkout lifetime plus the
    /// grace period, so a late settlement for a still-payable session always
    /// finds its row pending.
    pub async fn reap_expired_holds(&self, now: DateTime<Utc>) -> BookingResult<u64> {
        let cutoff = now - self.policy.hold_ttl - self.policy.hold_grace;
        let mut conn = self.pool.acquire().await?;
        let expired = reservations::expire_pending_before(&mut conn, cutoff, now).await?;
        if expired > 0 {
            info!(expired, cutoff = %cutoff, "Expired abandoned holds");
        } else {
            debug!("No abandoned holds");
        }
        Ok(expired)
    }
}
