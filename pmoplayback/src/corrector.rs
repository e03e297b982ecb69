//! Correcteur de synchronisation
//!
//! Boucle fermée proportionnelle sur l'erreur filtrée : suffit à rattraper
//! à la fois l'offset initial et la dérive continue des quartz, sans
//! estimation explicite de dérive. Le plafond de 4 % garde les artefacts
//! inaudibles sur de la musique ; le seuil de 500 ms couvre les sauts
//! d'horloge catastrophiques (veille/reprise).

use pmosync::TimeFilter;

use crate::format::PcmFormat;
use crate::state::{PlaybackState, SharedState};

/// En deçà de cette erreur filtrée, aucune correction n'est armée (2 ms).
const CORRECTION_DEADBAND_US: f64 = 2_000.0;
/// Au-delà de cette erreur filtrée, on réancre au lieu de corriger (500 ms).
const REANCHOR_THRESHOLD_US: f64 = 500_000.0;
/// Durée minimale entre deux réancrages (5 s).
const REANCHOR_COOLDOWN_US: i64 = 5_000_000;
/// Fenêtre cible de résorption de l'erreur par micro-corrections (2 s).
const CORRECTION_TARGET_SECONDS: f64 = 2.0;
/// Taux de correction maximal, en fraction de la cadence nominale (4 %).
const MAX_SPEED_CORRECTION: f64 = 0.04;
/// Bruit de mesure attendu sur l'erreur brute (gigue ≈ 5 ms).
const SYNC_MEASUREMENT_NOISE_US: f64 = 5_000.0;

/// Décision prise à chaque évaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Correction {
    /// Erreur dans la bande morte : cadences effacées.
    InDeadband,
    /// Cadence insert/drop reprogrammée.
    Cadence,
    /// Désynchronisation grossière : le lecteur doit réancrer.
    Reanchor,
}

pub(crate) struct SyncCorrector {
    filter: TimeFilter,
    /// Hors de l'état effacé par `clear()` : l'hystérésis de réancrage
    /// survit aux remises à zéro.
    last_reanchor_host_us: i64,
}

impl SyncCorrector {
    pub(crate) fn new() -> Self {
        Self {
            filter: TimeFilter::new(0.01, 1.001),
            last_reanchor_host_us: 0,
        }
    }

    /// Intègre une erreur brute (position DAC − curseur serveur, µs) et
    /// programme la cadence de correction dans l'état partagé.
    pub(crate) fn evaluate(
        &mut self,
        now_us: i64,
        raw_error_us: i64,
        format: &PcmFormat,
        shared: &SharedState,
    ) -> Correction {
        self.filter
            .update(raw_error_us as f64, SYNC_MEASUREMENT_NOISE_US, now_us);
        let filtered = self.filter.offset();
        let abs_error = filtered.abs();

        if abs_error <= CORRECTION_DEADBAND_US {
            shared.set_cadence(0, 0);
            return Correction::InDeadband;
        }

        if abs_error > REANCHOR_THRESHOLD_US
            && shared.state() == PlaybackState::Playing
            && now_us - self.last_reanchor_host_us > REANCHOR_COOLDOWN_US
        {
            self.last_reanchor_host_us = now_us;
            shared.set_cadence(0, 0);
            return Correction::Reanchor;
        }

        // Contrôle proportionnel : résorber l'erreur dans la fenêtre cible,
        // plafonné à 4 % de la cadence.
        let rate = f64::from(format.sample_rate);
        let frames_error = abs_error * rate / 1_000_000.0;
        let desired_per_sec = frames_error / CORRECTION_TARGET_SECONDS;
        let max_per_sec = rate * MAX_SPEED_CORRECTION;
        let corrections_per_sec = desired_per_sec.min(max_per_sec);
        let interval = ((rate / corrections_per_sec) as i64).max(1) as u32;

        if filtered > 0.0 {
            // En retard (le DAC est en avance sur la lecture) : drops.
            shared.set_cadence(0, interval);
        } else {
            // En avance : inserts.
            shared.set_cadence(interval, 0);
        }
        Correction::Cadence
    }

    pub(crate) fn filtered_error_us(&self) -> f64 {
        self.filter.offset()
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.filter.is_synchronized()
    }

    pub(crate) fn reset_filter(&mut self) {
        self.filter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BitDepth;
    use pmodecode::FrameCodec;

    fn fmt() -> PcmFormat {
        PcmFormat {
            codec: FrameCodec::Pcm,
            sample_rate: 44_100,
            channels: 2,
            bit_depth: BitDepth::B16,
        }
    }

    fn feed(corrector: &mut SyncCorrector, shared: &SharedState, error_us: i64, n: usize) {
        for i in 0..n {
            corrector.evaluate(i as i64 * 125_000, error_us, &fmt(), shared);
        }
    }

    #[test]
    fn test_deadband_clears_cadence() {
        let shared = SharedState::new(100, false);
        let mut corrector = SyncCorrector::new();
        feed(&mut corrector, &shared, 1_000, 10);
        assert_eq!(shared.cadence(), (0, 0));
    }

    #[test]
    fn test_late_error_programs_drops() {
        let shared = SharedState::new(100, false);
        shared.set_state(PlaybackState::Playing);
        let mut corrector = SyncCorrector::new();
        feed(&mut corrector, &shared, 50_000, 10);
        let (insert, drop) = shared.cadence();
        assert_eq!(insert, 0);
        assert!(drop > 0);
    }

    #[test]
    fn test_early_error_programs_inserts() {
        let shared = SharedState::new(100, false);
        shared.set_state(PlaybackState::Playing);
        let mut corrector = SyncCorrector::new();
        feed(&mut corrector, &shared, -50_000, 10);
        let (insert, drop) = shared.cadence();
        assert!(insert > 0);
        assert_eq!(drop, 0);
    }

    #[test]
    fn test_correction_rate_never_exceeds_four_percent() {
        let shared = SharedState::new(100, false);
        shared.set_state(PlaybackState::Playing);
        let mut corrector = SyncCorrector::new();
        for error in [3_000i64, 20_000, 100_000, 400_000] {
            corrector.reset_filter();
            feed(&mut corrector, &shared, error, 20);
            let (insert, drop) = shared.cadence();
            let interval = insert.max(drop);
            if interval > 0 {
                let per_sec = 44_100.0 / f64::from(interval);
                assert!(per_sec <= 44_100.0 * 0.04 + 1.0, "error {error}: {per_sec}/s");
            }
        }
    }

    #[test]
    fn test_reanchor_requires_playing_state() {
        let shared = SharedState::new(100, false);
        let mut corrector = SyncCorrector::new();
        // 700 ms d'erreur mais état non Playing : pas de réancrage.
        let mut outcome = Correction::InDeadband;
        for i in 0..10 {
            outcome = corrector.evaluate(6_000_000 + i * 125_000, 700_000, &fmt(), &shared);
        }
        assert_ne!(outcome, Correction::Reanchor);
    }

    #[test]
    fn test_reanchor_hysteresis() {
        let shared = SharedState::new(100, false);
        shared.set_state(PlaybackState::Playing);
        let mut corrector = SyncCorrector::new();

        // Convergence du filtre sur une erreur énorme, après le cooldown
        // initial.
        let mut reanchors = 0;
        let mut now = 6_000_000i64;
        for _ in 0..200 {
            now += 125_000;
            if corrector.evaluate(now, 800_000, &fmt(), &shared) == Correction::Reanchor {
                reanchors += 1;
            }
        }
        // 200 itérations = 25 s : au plus un réancrage par fenêtre de 5 s.
        assert!(reanchors <= 5, "reanchors = {reanchors}");
        assert!(reanchors >= 1);
    }
}
