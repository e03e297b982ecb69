//! Mapping temps serveur ↔ temps hôte
//!
//! Les paramètres (offset, dérive, délai statique) proviennent de
//! l'estimateur de synchronisation du transport et sont mis à jour à chaque
//! message `clock_update`. Les conversions sont de l'arithmétique pure sur
//! ces paramètres : jamais bloquantes, appelables depuis le callback audio.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::seq::SeqLock;

/// Dérive maximale tolérée, en ppm. Au-delà, l'estimation est clampée pour
/// garder la dérivée du mapping dans [0.999, 1.001].
const MAX_SKEW_PPM: f64 = 1_000.0;

const PPB_PER_PPM: f64 = 1_000.0;
const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// Convertisseur bidirectionnel entre horodatages serveur et temps monotone
/// hôte, tous deux en µs.
///
/// Le mapping est affine et quasi-identitaire :
///
/// ```text
/// hôte = serveur + offset + serveur·skew + délai_statique
/// ```
///
/// `to_client` et `to_server` sont mutuellement inverses (à l'arrondi µs
/// près) et monotones croissantes.
pub struct ClockMapper {
    /// `[offset_us, skew_ppb]`, publiés ensemble par la tâche transport.
    params: SeqLock<2>,
    /// Délai statique en µs, modifiable indépendamment par le contrôle.
    static_delay_us: AtomicI64,
}

impl ClockMapper {
    /// Mapper identité (offset nul, dérive nulle, délai nul).
    pub fn new() -> Self {
        Self {
            params: SeqLock::new(),
            static_delay_us: AtomicI64::new(0),
        }
    }

    /// Applique une mise à jour de l'estimateur de synchronisation.
    ///
    /// La dérive est clampée à ±1000 ppm pour que la dérivée du mapping
    /// reste dans [0.999, 1.001]. Réservé à la tâche transport (unique
    /// écrivain des paramètres).
    pub fn update(&self, offset_us: i64, skew_ppm: f64, static_delay_ms: f64) {
        let clamped_ppm = skew_ppm.clamp(-MAX_SKEW_PPM, MAX_SKEW_PPM);
        if clamped_ppm != skew_ppm {
            tracing::warn!(skew_ppm, "clock skew estimate clamped to ±{} ppm", MAX_SKEW_PPM);
        }
        let skew_ppb = (clamped_ppm * PPB_PER_PPM).round() as i64;
        self.params.write([offset_us, skew_ppb]);
        self.set_static_delay_ms(static_delay_ms);
    }

    /// Change uniquement le délai statique (chemin contrôle).
    pub fn set_static_delay_ms(&self, delay_ms: f64) {
        let delay_us = (delay_ms * 1_000.0).round() as i64;
        self.static_delay_us.store(delay_us, Ordering::Release);
    }

    /// Délai statique courant en millisecondes.
    pub fn static_delay_ms(&self) -> f64 {
        self.static_delay_us.load(Ordering::Acquire) as f64 / 1_000.0
    }

    /// Convertit un horodatage serveur (µs) en temps monotone hôte (µs).
    pub fn to_client(&self, server_us: i64) -> i64 {
        let [offset_us, skew_ppb] = self.params.read();
        let delay_us = self.static_delay_us.load(Ordering::Acquire);
        let skew_term = (server_us as i128 * skew_ppb as i128) / NANOS_PER_SECOND;
        server_us + offset_us + skew_term as i64 + delay_us
    }

    /// Convertit un temps monotone hôte (µs) en horodatage serveur (µs).
    /// Inverse de [`Self::to_client`].
    pub fn to_server(&self, host_us: i64) -> i64 {
        let [offset_us, skew_ppb] = self.params.read();
        let delay_us = self.static_delay_us.load(Ordering::Acquire);
        let base = (host_us - offset_us - delay_us) as i128;
        (base * NANOS_PER_SECOND / (NANOS_PER_SECOND + skew_ppb as i128)) as i64
    }
}

impl Default for ClockMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_by_default() {
        let clock = ClockMapper::new();
        assert_eq!(clock.to_client(123_456), 123_456);
        assert_eq!(clock.to_server(123_456), 123_456);
    }

    #[test]
    fn test_constant_offset() {
        let clock = ClockMapper::new();
        clock.update(250_000, 0.0, 0.0);
        assert_eq!(clock.to_client(1_000_000), 1_250_000);
        assert_eq!(clock.to_server(1_250_000), 1_000_000);
    }

    #[test]
    fn test_static_delay_shifts_both_directions() {
        let clock = ClockMapper::new();
        clock.update(0, 0.0, 50.0);
        assert_eq!(clock.to_client(1_000_000), 1_050_000);
        assert_eq!(clock.to_server(1_050_000), 1_000_000);
    }

    #[test]
    fn test_skew_round_trip_within_one_microsecond() {
        let clock = ClockMapper::new();
        clock.update(-12_345, 200.0, 10.0); // 200 ppm de dérive
        for server_us in [0i64, 1_000_000, 3_600_000_000, 86_400_000_000] {
            let client = clock.to_client(server_us);
            let back = clock.to_server(client);
            assert!((back - server_us).abs() <= 1, "round trip {server_us} -> {back}");
        }
    }

    #[test]
    fn test_skew_is_clamped() {
        let clock = ClockMapper::new();
        clock.update(0, 50_000.0, 0.0); // estimation aberrante
        // 1 s côté serveur ne doit pas dériver de plus de 1 ms.
        let client = clock.to_client(1_000_000);
        assert!((client - 1_000_000).abs() <= 1_000);
    }

    #[test]
    fn test_monotone_non_decreasing() {
        let clock = ClockMapper::new();
        clock.update(7_000, -400.0, 5.0);
        let mut prev = i64::MIN;
        for server_us in (0..10_000_000).step_by(997) {
            let client = clock.to_client(server_us);
            assert!(client >= prev);
            prev = client;
        }
    }
}
