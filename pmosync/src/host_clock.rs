//! Horloge monotone locale en microsecondes.

use once_cell::sync::Lazy;
use std::time::Instant;

static HOST_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Temps monotone hôte en µs depuis le premier appel du processus.
///
/// Sûr depuis le callback audio : simple lecture d'horloge système, aucune
/// allocation.
pub fn host_now_us() -> i64 {
    HOST_EPOCH.elapsed().as_micros() as i64
}
