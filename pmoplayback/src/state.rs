//! État partagé entre le producteur, le callback audio et le contrôle.
//!
//! Tout passe par des atomiques : le callback temps-réel ne prend jamais de
//! lock. Les seuls signaux inter-threads sont ceux listés ici, plus la file
//! de chunks elle-même.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use pmosync::{CalibrationSnapshot, SeqLock};
use serde::Serialize;

/// Sentinelle « non planifié » pour les cibles de démarrage.
pub(crate) const TIME_UNSET: i64 = i64::MIN;

/// Cycle de vie de la lecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// En attente du premier chunk et des informations de synchro.
    Initializing,
    /// Démarrage planifié, silence jusqu'à la porte de départ.
    WaitingForStart,
    /// Lecture active avec micro-corrections de synchro.
    Playing,
    /// Désynchronisation grossière détectée, réancrage en cours.
    Reanchoring,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::WaitingForStart,
            2 => PlaybackState::Playing,
            3 => PlaybackState::Reanchoring,
            _ => PlaybackState::Initializing,
        }
    }
}

/// Bloc de contrôle partagé du lecteur.
///
/// Écrivains par champ :
/// - callback : curseur serveur, position de lecture, calibration publiée,
///   compteurs d'instrumentation, `clear_requested`, raffinement de la
///   cible DAC
/// - producteur : cadences de correction, cibles de démarrage, époques,
///   durée bufferisée (incréments), état de lecture
/// - contrôle : volume et mute
pub(crate) struct SharedState {
    state: AtomicU8,
    /// Époque de contenu : bump à chaque purge de la file.
    pub(crate) content_epoch: AtomicU64,
    /// Époque complète : bump à chaque remise à zéro totale (réancrage,
    /// underflow, changement de format).
    pub(crate) full_epoch: AtomicU64,
    /// Levée par le callback après un underflow, consommée par le
    /// producteur au prochain submit.
    pub(crate) clear_requested: AtomicBool,

    pub(crate) volume: AtomicU8,
    pub(crate) muted: AtomicBool,

    /// Horodatage serveur de la prochaine frame qui sera lue.
    pub(crate) server_cursor_us: AtomicI64,
    /// Horodatage serveur de l'échantillon en cours de conversion au DAC.
    pub(crate) playback_position_us: AtomicI64,
    /// Durée totale bufferisée dans la file, en µs.
    pub(crate) queued_duration_us: AtomicI64,

    pub(crate) scheduled_start_host_us: AtomicI64,
    pub(crate) scheduled_start_dac_us: AtomicI64,
    pub(crate) early_start_suspect: AtomicBool,
    pub(crate) has_reanchored: AtomicBool,

    insert_every_n: AtomicU32,
    drop_every_n: AtomicU32,

    /// Deux dernières paires de calibration + tag d'époque complète,
    /// publiées par le callback.
    calibration: SeqLock<5>,
    /// Occupation courante de l'anneau de calibration du callback, bornée
    /// par construction à [`pmosync::CALIBRATION_RING`].
    pub(crate) calibration_ring_len: AtomicU64,

    // Instrumentation, remise à zéro à chaque période de log.
    pub(crate) underrun_count: AtomicU64,
    pub(crate) frames_inserted: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) callback_time_total_us: AtomicI64,
    pub(crate) callback_count: AtomicU64,
}

impl SharedState {
    pub(crate) fn new(volume: u8, muted: bool) -> Self {
        Self {
            state: AtomicU8::new(PlaybackState::Initializing as u8),
            content_epoch: AtomicU64::new(0),
            full_epoch: AtomicU64::new(0),
            clear_requested: AtomicBool::new(false),
            volume: AtomicU8::new(volume.min(100)),
            muted: AtomicBool::new(muted),
            server_cursor_us: AtomicI64::new(0),
            playback_position_us: AtomicI64::new(0),
            queued_duration_us: AtomicI64::new(0),
            scheduled_start_host_us: AtomicI64::new(TIME_UNSET),
            scheduled_start_dac_us: AtomicI64::new(TIME_UNSET),
            early_start_suspect: AtomicBool::new(false),
            has_reanchored: AtomicBool::new(false),
            insert_every_n: AtomicU32::new(0),
            drop_every_n: AtomicU32::new(0),
            calibration: SeqLock::new(),
            calibration_ring_len: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            frames_inserted: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            callback_time_total_us: AtomicI64::new(0),
            callback_count: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PlaybackState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Programme la cadence de correction. Au plus une des deux est non
    /// nulle.
    pub(crate) fn set_cadence(&self, insert_every_n: u32, drop_every_n: u32) {
        debug_assert!(insert_every_n == 0 || drop_every_n == 0);
        self.insert_every_n.store(insert_every_n, Ordering::Release);
        self.drop_every_n.store(drop_every_n, Ordering::Release);
    }

    pub(crate) fn cadence(&self) -> (u32, u32) {
        (
            self.insert_every_n.load(Ordering::Acquire),
            self.drop_every_n.load(Ordering::Acquire),
        )
    }

    /// Publication des deux dernières paires de calibration, taguée avec
    /// l'époque complète courante. Réservé au callback (unique écrivain).
    pub(crate) fn publish_calibration(
        &self,
        snapshot: CalibrationSnapshot,
        full_epoch: u64,
        ring_len: usize,
    ) {
        let [a, b, c, d] = snapshot.to_slots();
        self.calibration.write([a, b, c, d, full_epoch as i64]);
        self.calibration_ring_len
            .store(ring_len as u64, Ordering::Relaxed);
    }

    /// Instantané de calibration côté producteur ; `None` tant que rien n'a
    /// été publié pour l'époque complète courante.
    pub(crate) fn calibration_snapshot(&self) -> Option<CalibrationSnapshot> {
        let [a, b, c, d, epoch] = self.calibration.read();
        if epoch as u64 != self.full_epoch.load(Ordering::Acquire) {
            return None;
        }
        CalibrationSnapshot::from_slots([a, b, c, d])
    }

    pub(crate) fn reset_instrumentation(&self) {
        self.underrun_count.store(0, Ordering::Relaxed);
        self.frames_inserted.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.callback_time_total_us.store(0, Ordering::Relaxed);
        self.callback_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        let shared = SharedState::new(100, false);
        assert_eq!(shared.state(), PlaybackState::Initializing);
        shared.set_state(PlaybackState::Playing);
        assert_eq!(shared.state(), PlaybackState::Playing);
    }

    #[test]
    fn test_calibration_snapshot_gated_by_epoch() {
        let shared = SharedState::new(100, false);
        let snap = CalibrationSnapshot {
            dac_ref: 10,
            host_ref: 20,
            dac_prev: 0,
            host_prev: 0,
        };
        shared.publish_calibration(snap, 0, 1);
        assert_eq!(shared.calibration_snapshot(), Some(snap));

        // Une remise à zéro complète invalide l'instantané publié.
        shared.full_epoch.fetch_add(1, Ordering::AcqRel);
        assert_eq!(shared.calibration_snapshot(), None);
    }
}
