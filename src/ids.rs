//! Identifier generation (spec §3, §4.2).

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a verification id: `verif-YYYYMMDDhhmmss-xxxx`, monotone by its
/// embedded timestamp with a random tail for intra-second uniqueness.
pub fn generate_verification_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y%m%d%H%M%S");
    let tail = &Uuid::new_v4().simple().to_string()[..4];
    format!("verif-{stamp}-{tail}")
}

/// Parse the `YYYYMMDDhhmmss` timestamp embedded in a verification id,
/// used by `FinalizeWithError` (spec §4.10) to recover `verificationAt`
/// when the initialization row was never written.
pub fn parse_embedded_timestamp(verification_id: &str) -> Option<DateTime<Utc>> {
    let digits = verification_id.strip_prefix("verif-")?;
    let stamp = digits.split('-').next()?;
    if stamp.len() != 14 {
        return None;
    }
    let naive = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}
