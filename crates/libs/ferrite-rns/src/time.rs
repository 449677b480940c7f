use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the unix epoch. All protocol deadlines are
/// computed against this value so the periodic sweep can be driven (and
/// tested) with an explicit `now`.
pub fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
