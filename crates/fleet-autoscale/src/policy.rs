//! Desired-count arithmetic for each launch policy.
//!
//! Pure functions over counts read from the store; the scaler supplies the
//! numbers and acts on the result.

use fleet_state::QuotaRecord;

/// Fraction of total player capacity above which more instances are wanted.
pub const PLAYER_LOAD_THRESHOLD: f64 = 0.75;

/// Launches wanted by a player-load type.
///
/// `online` counts every record of the type, provisional ones included, and
/// `players` is the sum of online players across them.
pub fn player_load_needed(quota: &QuotaRecord, online: u32, players: u32, max_players: u32) -> u32 {
    let threshold = PLAYER_LOAD_THRESHOLD * f64::from(max_players) * f64::from(online);
    let players_f = f64::from(players);
    let scale_up = if players == 0 || players_f <= threshold {
        0
    } else if threshold <= 0.0 {
        // Players on a type with no capacity yet (or zero max_players).
        1
    } else {
        (players_f / threshold).floor() as u32 + 1
    };
    quota.minimum_amount.saturating_sub(online) + scale_up
}

/// Launches wanted by an availability type: keep `minimum_amount` joinable.
pub fn availability_needed(quota: &QuotaRecord, available: u32) -> u32 {
    quota.minimum_amount.saturating_sub(available)
}

/// Cap a launch count so `online` never passes `maximum_amount`.
pub fn clamp_needed(needed: u32, quota: &QuotaRecord, online: u32) -> u32 {
    needed.min(quota.maximum_amount.saturating_sub(online))
}

/// How many empty default instances may be retired.
pub fn surplus(quota: &QuotaRecord, online: u32) -> u32 {
    online.saturating_sub(quota.minimum_amount)
}
