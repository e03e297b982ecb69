//! Côté producteur du moteur de lecture synchronisée
//!
//! [`SyncPlayer`] reçoit les chunks horodatés du transport, les normalise,
//! planifie l'instant de démarrage dans l'échelle hôte puis DAC, et pilote
//! le correcteur de synchro. Son jumeau [`CallbackCore`] consomme la file
//! depuis le thread audio ; les deux sont créés ensemble par
//! [`SyncPlayer::new`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use pmosync::{host_now_us, ClockMapper, MICROS_PER_SECOND};

use crate::callback::CallbackCore;
use crate::corrector::{Correction, SyncCorrector};
use crate::device::OutputControl;
use crate::error::PlaybackError;
use crate::format::PcmFormat;
use crate::queue::{chunk_channel, Normalizer, QueuedChunk};
use crate::state::{PlaybackState, SharedState, TIME_UNSET};

/// Si le démarrage planifié tombe à moins de 700 ms, l'estimation d'horloge
/// n'a probablement pas convergé : on suspecte un démarrage précoce.
const EARLY_START_THRESHOLD_US: i64 = 700_000;
/// Variation minimale pour accepter une mise à jour de l'instant de
/// démarrage (5 ms), pour éviter le papillonnement.
const START_TIME_UPDATE_THRESHOLD_US: i64 = 5_000;

/// Métriques de timing exposées pour le monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingMetrics {
    /// Position de lecture courante dans l'échelle serveur, en µs.
    pub playback_position_us: i64,
    /// Horodatage serveur de la prochaine frame d'entrée à lire, en µs.
    pub server_cursor_us: i64,
    /// Erreur de synchro filtrée courante, en µs (positive = en retard).
    pub sync_error_us: f64,
    /// Durée d'audio bufferisée dans la file, en µs.
    pub buffered_audio_us: i64,
    /// Paires de calibration DAC actuellement retenues dans l'anneau
    /// (bornées à [`pmosync::CALIBRATION_RING`]).
    pub dac_calibrations: u64,
    /// Nombre d'underflows détectés depuis la dernière remise à zéro.
    pub underruns: u64,
}

/// Lecteur audio synchronisé, côté producteur.
pub struct SyncPlayer {
    format: PcmFormat,
    clock: Arc<ClockMapper>,
    shared: Arc<SharedState>,
    tx: Sender<QueuedChunk>,
    /// Clone du récepteur, utilisé uniquement pour les purges différées.
    drain_rx: Receiver<QueuedChunk>,
    normalizer: Normalizer,
    corrector: SyncCorrector,
    first_server_ts_us: Option<i64>,
    output: Option<Box<dyn OutputControl>>,
    output_started: bool,
    device_failed: bool,
    last_stats_log_us: i64,
    dropped_submissions: u64,
}

impl SyncPlayer {
    /// Construit le couple producteur / cœur de callback. Le cœur est
    /// destiné à la couche périphérique ([`crate::device::CpalOutput`]) ou
    /// à un pilotage direct.
    pub fn new(
        format: PcmFormat,
        clock: Arc<ClockMapper>,
    ) -> Result<(Self, CallbackCore), PlaybackError> {
        format.validate()?;
        let shared = Arc::new(SharedState::new(100, false));
        let (tx, rx) = chunk_channel();
        let drain_rx = rx.clone();
        let core = CallbackCore::new(format, shared.clone(), clock.clone(), rx);
        let player = Self {
            format,
            clock,
            shared,
            tx,
            drain_rx,
            normalizer: Normalizer::new(),
            corrector: SyncCorrector::new(),
            first_server_ts_us: None,
            output: None,
            output_started: false,
            device_failed: false,
            last_stats_log_us: 0,
            dropped_submissions: 0,
        };
        Ok((player, core))
    }

    /// Attache le contrôle du périphérique de sortie. Le périphérique est
    /// démarré au premier contenu bufferisé.
    pub fn attach_output(&mut self, output: Box<dyn OutputControl>) {
        self.output = Some(output);
    }

    pub fn format(&self) -> &PcmFormat {
        &self.format
    }

    pub fn state(&self) -> PlaybackState {
        self.shared.state()
    }

    pub fn volume(&self) -> u8 {
        self.shared.volume.load(Ordering::Acquire)
    }

    pub fn muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Change volume et mute ; audible dans la période de buffer suivante.
    pub fn set_volume(&self, level: u8, muted: bool) {
        self.shared.volume.store(level.min(100), Ordering::Release);
        self.shared.muted.store(muted, Ordering::Release);
    }

    /// Soumet un chunk PCM horodaté (heure hôte courante implicite).
    pub fn submit(&mut self, server_ts_us: i64, pcm: Vec<u8>) -> Result<(), PlaybackError> {
        self.submit_at(host_now_us(), server_ts_us, pcm)
    }

    /// Soumet un chunk PCM horodaté en fournissant explicitement l'heure
    /// hôte courante en µs.
    pub fn submit_at(
        &mut self,
        now_us: i64,
        server_ts_us: i64,
        pcm: Vec<u8>,
    ) -> Result<(), PlaybackError> {
        if self.device_failed {
            return Err(PlaybackError::DeviceConfig(
                "output device unavailable, reconfigure required".into(),
            ));
        }

        // Purge différée demandée par le callback après un underflow.
        if self.shared.clear_requested.swap(false, Ordering::AcqRel) {
            self.clear();
            tracing::info!("cleared audio queue after underflow (deferred from audio callback)");
        }

        let frame_size = self.format.frame_size();
        if pcm.len() % frame_size != 0 {
            tracing::warn!(
                size = pcm.len(),
                frame_size,
                "dropping audio chunk with invalid size"
            );
            return Ok(());
        }

        // Erreur de synchro et micro-corrections, uniquement en lecture
        // active.
        if self.shared.state() == PlaybackState::Playing {
            let position = self.shared.playback_position_us.load(Ordering::Acquire);
            let cursor = self.shared.server_cursor_us.load(Ordering::Acquire);
            if position > 0 && cursor > 0 {
                let raw_error = position - cursor;
                if self.corrector.evaluate(now_us, raw_error, &self.format, &self.shared)
                    == Correction::Reanchor
                {
                    tracing::info!(
                        error_ms = self.corrector.filtered_error_us() / 1_000.0,
                        "sync error too large; re-anchoring"
                    );
                    self.shared.set_state(PlaybackState::Reanchoring);
                    self.shared.has_reanchored.store(true, Ordering::Release);
                    self.clear();
                }
            }
        }

        self.schedule_start(now_us, server_ts_us);
        self.log_periodic_stats(now_us);

        // Normalisation gap/recouvrement puis mise en file.
        let normalized = self.normalizer.normalize(&self.format, server_ts_us, pcm);
        for chunk in normalized.into_chunks() {
            let chunk_frames = (chunk.pcm.len() / frame_size) as i64;
            let duration = self.format.duration_us(chunk_frames);
            match self.tx.try_send(chunk) {
                Ok(()) => {
                    self.shared
                        .queued_duration_us
                        .fetch_add(duration, Ordering::AcqRel);
                }
                Err(TrySendError::Full(_)) => {
                    self.dropped_submissions += 1;
                    tracing::warn!(
                        dropped = self.dropped_submissions,
                        "audio queue full; dropping chunk"
                    );
                }
                Err(TrySendError::Disconnected(_)) => return Err(PlaybackError::QueueClosed),
            }
        }

        // Démarrage du périphérique au premier contenu.
        if !self.output_started && !self.drain_rx.is_empty() {
            if let Some(output) = self.output.as_mut() {
                match output.start() {
                    Ok(()) => {
                        self.output_started = true;
                        tracing::info!(
                            buffered_s = self.shared.queued_duration_us.load(Ordering::Acquire)
                                as f64
                                / MICROS_PER_SECOND as f64,
                            "output stream started"
                        );
                    }
                    Err(err) => {
                        self.device_failed = true;
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Planifie ou raffine l'instant de démarrage dans l'échelle hôte, et
    /// tente l'ancrage DAC via les calibrations publiées par le callback.
    fn schedule_start(&mut self, now_us: i64, server_ts_us: i64) {
        let start_host = self.shared.scheduled_start_host_us.load(Ordering::Acquire);
        if start_host == TIME_UNSET {
            let computed = self.clock.to_client(server_ts_us);
            self.shared
                .scheduled_start_host_us
                .store(computed, Ordering::Release);
            let est_dac = self.estimate_dac_for_server_ts(server_ts_us);
            self.shared
                .scheduled_start_dac_us
                .store(est_dac.unwrap_or(TIME_UNSET), Ordering::Release);
            self.first_server_ts_us = Some(server_ts_us);
            self.shared.set_state(PlaybackState::WaitingForStart);
            if computed - now_us <= EARLY_START_THRESHOLD_US {
                self.shared.early_start_suspect.store(true, Ordering::Release);
                tracing::debug!(
                    lead_ms = (computed - now_us) as f64 / 1_000.0,
                    "scheduled start is very near; suspecting unconverged clock estimate"
                );
            }
            tracing::debug!(server_ts_us, start_host_us = computed, "playback start scheduled");
        } else if self.shared.state() == PlaybackState::WaitingForStart {
            // L'estimation d'horloge s'améliore pendant l'attente : on suit
            // les déplacements significatifs de la cible.
            let Some(first_ts) = self.first_server_ts_us else {
                return;
            };
            let updated = self.clock.to_client(first_ts);
            if (updated - start_host).abs() > START_TIME_UPDATE_THRESHOLD_US {
                self.shared
                    .scheduled_start_host_us
                    .store(updated, Ordering::Release);
                let est_dac = self.estimate_dac_for_server_ts(first_ts);
                self.shared
                    .scheduled_start_dac_us
                    .store(est_dac.unwrap_or(TIME_UNSET), Ordering::Release);
            }
        }
    }

    /// serveur → hôte via le mapper, puis hôte → DAC via la dernière
    /// calibration publiée. `None` sans calibration valide.
    fn estimate_dac_for_server_ts(&self, server_ts_us: i64) -> Option<i64> {
        let host_us = self.clock.to_client(server_ts_us);
        let snapshot = self.shared.calibration_snapshot()?;
        Some(snapshot.host_to_dac(host_us))
    }

    /// Remise à zéro complète : file, planification, machine à états,
    /// filtre de synchro et calibrations. Le prochain chunk réentre en
    /// `WaitingForStart`.
    pub fn clear(&mut self) {
        while self.drain_rx.try_recv().is_ok() {}
        self.normalizer.reset();
        self.corrector.reset_filter();
        self.first_server_ts_us = None;

        let shared = &self.shared;
        shared.set_cadence(0, 0);
        shared
            .scheduled_start_host_us
            .store(TIME_UNSET, Ordering::Release);
        shared
            .scheduled_start_dac_us
            .store(TIME_UNSET, Ordering::Release);
        shared.server_cursor_us.store(0, Ordering::Release);
        shared.playback_position_us.store(0, Ordering::Release);
        shared.queued_duration_us.store(0, Ordering::Release);
        shared.early_start_suspect.store(false, Ordering::Release);
        shared.clear_requested.store(false, Ordering::Release);
        shared.calibration_ring_len.store(0, Ordering::Release);
        shared.reset_instrumentation();
        shared.set_state(PlaybackState::Initializing);
        // Le callback jette son chunk partiel et ses calibrations en voyant
        // l'époque complète bouger.
        shared.full_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Purge douce : jette le contenu bufferisé sans toucher à la machine à
    /// états ni aux calibrations (changement de piste côté serveur).
    pub fn clear_queue(&mut self) {
        while self.drain_rx.try_recv().is_ok() {}
        self.normalizer.reset();
        self.shared.queued_duration_us.store(0, Ordering::Release);
        self.shared.content_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Arrête le périphérique de sortie et libère la session.
    pub fn stop(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.stop();
        }
        self.output_started = false;
    }

    pub fn timing_metrics(&self) -> TimingMetrics {
        TimingMetrics {
            playback_position_us: self.shared.playback_position_us.load(Ordering::Acquire),
            server_cursor_us: self.shared.server_cursor_us.load(Ordering::Acquire),
            sync_error_us: self.corrector.filtered_error_us(),
            buffered_audio_us: self.shared.queued_duration_us.load(Ordering::Acquire),
            dac_calibrations: self.shared.calibration_ring_len.load(Ordering::Relaxed),
            underruns: self.shared.underrun_count.load(Ordering::Relaxed),
        }
    }

    /// Journal de synchro à 1 Hz une fois le filtre acquis : erreur
    /// filtrée, profondeur de buffer, vitesse de lecture dérivée des
    /// compteurs insert/drop, temps moyen de callback.
    fn log_periodic_stats(&mut self, now_us: i64) {
        if !self.corrector.is_synchronized() {
            return;
        }
        if now_us - self.last_stats_log_us < MICROS_PER_SECOND {
            return;
        }
        self.last_stats_log_us = now_us;

        let inserted = self.shared.frames_inserted.swap(0, Ordering::Relaxed);
        let dropped = self.shared.frames_dropped.swap(0, Ordering::Relaxed);
        let callback_total = self.shared.callback_time_total_us.swap(0, Ordering::Relaxed);
        let callback_count = self.shared.callback_count.swap(0, Ordering::Relaxed);

        let rate = i64::from(self.format.sample_rate);
        // Les drops sautent des frames source (la piste avance plus vite),
        // les inserts les répètent (elle avance moins vite).
        let track_frames = rate + dropped as i64 - inserted as i64;
        let speed_percent = track_frames as f64 / rate as f64 * 100.0;
        let avg_callback_us = callback_total as f64 / callback_count.max(1) as f64;

        tracing::debug!(
            error_ms = self.corrector.filtered_error_us() / 1_000.0,
            buffer_s = self.shared.queued_duration_us.load(Ordering::Acquire) as f64
                / MICROS_PER_SECOND as f64,
            speed_percent,
            inserted,
            dropped,
            avg_callback_us,
            "sync status"
        );
    }
}
