//! Cœur temps-réel du lecteur
//!
//! [`CallbackCore`] vit dans le thread du pilote audio et remplit chaque
//! buffer de sortie. Contraintes dures : aucune allocation, aucun lock
//! contendable, aucune E/S. Deux chemins de lecture :
//!
//! - **chemin rapide** : copie en bloc depuis la file quand aucune
//!   correction n'est armée
//! - **chemin lent** : copies par segments entrecoupées de duplications
//!   (insert) ou de sauts (drop) d'une frame, à la cadence programmée par
//!   le correcteur
//!
//! Le cœur pousse aussi la paire de calibration `(dac, hôte)` de chaque
//! callback et publie la position de lecture dans l'échelle serveur.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use pmosync::{host_now_us, ClockMapper, DacCalibrator};

use crate::format::PcmFormat;
use crate::queue::QueuedChunk;
use crate::state::{PlaybackState, SharedState, TIME_UNSET};

/// Taille de frame maximale gérée sans allocation (8 canaux × 32 bits).
pub(crate) const MAX_FRAME_SIZE: usize = 32;

/// Indicateurs d'état transmis par la couche périphérique au cœur.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackStatus {
    /// Le pilote (ou la détection de famine interne) signale un underflow.
    pub underflow: bool,
}

/// Curseur de timeline serveur : horodatage de la prochaine frame d'entrée
/// à lire, avec report du modulo pour ne pas accumuler de biais
/// sous-microseconde.
struct ServerCursor {
    us: i64,
    remainder: i64,
}

impl ServerCursor {
    fn new() -> Self {
        Self { us: 0, remainder: 0 }
    }

    fn advance(&mut self, frames: i64, sample_rate: u32) {
        if frames <= 0 {
            return;
        }
        self.remainder += frames * 1_000_000;
        let rate = i64::from(sample_rate);
        if self.remainder >= rate {
            self.us += self.remainder / rate;
            self.remainder %= rate;
        }
    }

    fn clear(&mut self) {
        self.us = 0;
        self.remainder = 0;
    }
}

/// Côté consommateur du moteur, propriété exclusive du thread audio.
pub struct CallbackCore {
    format: PcmFormat,
    frame_size: usize,
    shared: Arc<SharedState>,
    clock: Arc<ClockMapper>,
    rx: Receiver<QueuedChunk>,

    calibrator: DacCalibrator,
    current: Option<QueuedChunk>,
    current_offset: usize,
    cursor: ServerCursor,

    insert_countdown: i64,
    drop_countdown: i64,
    last_frame: [u8; MAX_FRAME_SIZE],
    has_last_frame: bool,

    content_epoch_seen: u64,
    full_epoch_seen: u64,
    starved: bool,
}

impl CallbackCore {
    pub(crate) fn new(
        format: PcmFormat,
        shared: Arc<SharedState>,
        clock: Arc<ClockMapper>,
        rx: Receiver<QueuedChunk>,
    ) -> Self {
        let frame_size = format.frame_size();
        debug_assert!(frame_size <= MAX_FRAME_SIZE);
        Self {
            format,
            frame_size,
            shared,
            clock,
            rx,
            calibrator: DacCalibrator::new(),
            current: None,
            current_offset: 0,
            cursor: ServerCursor::new(),
            insert_countdown: 0,
            drop_countdown: 0,
            last_frame: [0u8; MAX_FRAME_SIZE],
            has_last_frame: false,
            content_epoch_seen: 0,
            full_epoch_seen: 0,
            starved: false,
        }
    }

    /// Vrai quand le dernier buffer a dû être complété de silence alors que
    /// la lecture était active. La couche périphérique s'en sert pour
    /// synthétiser le statut underflow au callback suivant.
    pub fn starved(&self) -> bool {
        self.starved
    }

    /// Remplit un buffer de sortie. Invoqué par le pilote audio avec le
    /// temps DAC du premier échantillon du buffer (si disponible) et le
    /// temps monotone hôte capturé au même instant.
    pub fn render(
        &mut self,
        out: &mut [u8],
        dac_us: Option<i64>,
        host_us: i64,
        status: CallbackStatus,
    ) {
        let entry_us = host_now_us();
        let frames = out.len() / self.frame_size;
        let bytes_needed = frames * self.frame_size;
        let out = &mut out[..bytes_needed];

        if status.underflow {
            self.shared
                .clear_requested
                .store(true, std::sync::atomic::Ordering::Release);
            self.shared
                .underrun_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.starved = false;
            out.fill(0);
            self.finish_instrumentation(entry_us);
            return;
        }

        self.sync_epochs();

        if let Some(dac) = dac_us {
            self.push_calibration(dac, host_us);
        }

        let mut offset = 0usize;
        match self.shared.state() {
            PlaybackState::Initializing | PlaybackState::Reanchoring => {
                out.fill(0);
                self.finish_instrumentation(entry_us);
                return;
            }
            PlaybackState::WaitingForStart => {
                offset = self.run_start_gate(out, frames, dac_us, host_us);
                if self.shared.state() != PlaybackState::Playing {
                    out[offset..].fill(0);
                    self.finish_instrumentation(entry_us);
                    return;
                }
            }
            PlaybackState::Playing => {}
        }

        // Instantané de la cadence : les changements en cours de callback
        // n'affectent que le buffer suivant.
        let (insert_every, drop_every) = self.shared.cadence();
        if insert_every == 0 && drop_every == 0 {
            self.read_bulk(&mut out[offset..]);
        } else {
            self.render_with_corrections(
                &mut out[offset..],
                i64::from(insert_every),
                i64::from(drop_every),
            );
        }

        self.apply_volume(out);
        self.finish_instrumentation(entry_us);
    }

    fn finish_instrumentation(&self, entry_us: i64) {
        use std::sync::atomic::Ordering;
        self.shared
            .callback_time_total_us
            .fetch_add(host_now_us() - entry_us, Ordering::Relaxed);
        self.shared.callback_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Aligne l'état local sur les époques publiées par le producteur.
    fn sync_epochs(&mut self) {
        use std::sync::atomic::Ordering;
        let full = self.shared.full_epoch.load(Ordering::Acquire);
        let content = self.shared.content_epoch.load(Ordering::Acquire);
        if full != self.full_epoch_seen {
            self.full_epoch_seen = full;
            self.content_epoch_seen = content;
            self.reset_read_state();
            self.calibrator.clear();
        } else if content != self.content_epoch_seen {
            self.content_epoch_seen = content;
            self.reset_read_state();
        }
    }

    fn reset_read_state(&mut self) {
        use std::sync::atomic::Ordering;
        self.current = None;
        self.current_offset = 0;
        self.cursor.clear();
        self.insert_countdown = 0;
        self.drop_countdown = 0;
        self.has_last_frame = false;
        self.starved = false;
        self.shared.server_cursor_us.store(0, Ordering::Release);
    }

    /// Capture la paire `(dac, hôte)`, publie la position de lecture dans
    /// l'échelle serveur et raffine la cible DAC de démarrage si besoin.
    fn push_calibration(&mut self, dac_us: i64, host_us: i64) {
        use std::sync::atomic::Ordering;
        self.calibrator.push(dac_us, host_us);
        let Some(snapshot) = self.calibrator.snapshot() else {
            return;
        };
        self.shared
            .publish_calibration(snapshot, self.full_epoch_seen, self.calibrator.len());

        let host_at_dac = snapshot.dac_to_host(dac_us);
        let position = self.clock.to_server(host_at_dac);
        self.shared
            .playback_position_us
            .store(position, Ordering::Release);

        let start_host = self.shared.scheduled_start_host_us.load(Ordering::Acquire);
        if start_host != TIME_UNSET
            && self.shared.scheduled_start_dac_us.load(Ordering::Acquire) == TIME_UNSET
        {
            self.shared
                .scheduled_start_dac_us
                .store(snapshot.host_to_dac(start_host), Ordering::Release);
        }
    }

    /// Porte de départ : silence jusqu'à la cible, démarrage au milieu du
    /// buffer quand la cible y tombe, avance rapide quand elle est dépassée
    /// (sous porte DAC uniquement). Retourne le nombre d'octets de silence
    /// écrits en tête de buffer.
    fn run_start_gate(
        &mut self,
        out: &mut [u8],
        frames: usize,
        dac_us: Option<i64>,
        host_us: i64,
    ) -> usize {
        use std::sync::atomic::Ordering;
        let start_dac = self.shared.scheduled_start_dac_us.load(Ordering::Acquire);
        let start_host = self.shared.scheduled_start_host_us.load(Ordering::Acquire);

        let (delta_us, dac_gating) = match (dac_us, start_dac != TIME_UNSET) {
            (Some(dac_now), true) => (start_dac - dac_now, true),
            _ if start_host != TIME_UNSET => (start_host - host_us, false),
            _ => return 0,
        };

        if delta_us > 0 {
            let until_start = self.format.frames_for_us_ceil(delta_us);
            let silence_frames = until_start.min(frames as i64) as usize;
            let silence_bytes = silence_frames * self.frame_size;
            out[..silence_bytes].fill(0);
            if silence_frames < frames {
                // La cible tombe dans ce buffer : l'audio réel démarre à
                // cet offset précis.
                self.shared.set_state(PlaybackState::Playing);
            }
            return silence_bytes;
        }

        if delta_us < 0 && dac_gating {
            // En retard : avance rapide en jetant des frames d'entrée,
            // sauf quand le démarrage précoce est suspect (mapping non
            // convergé) et qu'aucun réancrage n'a encore eu lieu.
            let suspect = self.shared.early_start_suspect.load(Ordering::Acquire)
                && !self.shared.has_reanchored.load(Ordering::Acquire);
            if !suspect {
                let to_skip = self.format.frames_for_us_ceil(-delta_us);
                self.skip_input_frames(to_skip);
            }
        }
        self.shared.set_state(PlaybackState::Playing);
        0
    }

    /// Charge le chunk suivant si nécessaire. Rebase le curseur serveur sur
    /// le premier chunk lu après une remise à zéro.
    fn ensure_current(&mut self) -> bool {
        if self.current.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(chunk) => {
                if self.cursor.us == 0 {
                    self.cursor.us = chunk.server_ts_us;
                    self.cursor.remainder = 0;
                }
                self.current = Some(chunk);
                self.current_offset = 0;
                true
            }
            Err(_) => false,
        }
    }

    /// Comptabilise la fin du chunk courant dans la durée bufferisée.
    fn finish_current(&mut self) {
        use std::sync::atomic::Ordering;
        let Some(chunk) = self.current.take() else {
            return;
        };
        let chunk_frames = (chunk.pcm.len() / self.frame_size) as i64;
        let duration = self.format.duration_us(chunk_frames);
        let _ = self
            .shared
            .queued_duration_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some((v - duration).max(0))
            });
        self.current_offset = 0;
    }

    /// Copie en bloc depuis la file, complète de silence si la file
    /// s'épuise. Avance le curseur du nombre exact de frames réelles lues
    /// et mémorise la dernière frame réelle émise.
    fn read_bulk(&mut self, out: &mut [u8]) {
        use std::sync::atomic::Ordering;
        let total = out.len();
        let mut written = 0usize;
        while written < total {
            if !self.ensure_current() {
                out[written..].fill(0);
                if self.shared.state() == PlaybackState::Playing && total > written {
                    self.starved = true;
                }
                break;
            }
            let Some(chunk) = self.current.as_ref() else {
                break;
            };
            let chunk_len = chunk.pcm.len();
            let available = chunk_len - self.current_offset;
            let take = available.min(total - written);
            out[written..written + take]
                .copy_from_slice(&chunk.pcm[self.current_offset..self.current_offset + take]);
            self.current_offset += take;
            written += take;
            self.cursor
                .advance((take / self.frame_size) as i64, self.format.sample_rate);
            if self.current_offset >= chunk_len {
                self.finish_current();
            }
        }
        if written >= total {
            self.starved = false;
        }
        self.shared
            .server_cursor_us
            .store(self.cursor.us, Ordering::Release);
        if written >= self.frame_size {
            self.last_frame[..self.frame_size]
                .copy_from_slice(&out[written - self.frame_size..written]);
            self.has_last_frame = true;
        }
    }

    /// Consomme une frame d'entrée sans l'émettre.
    fn read_one_frame_discard(&mut self) {
        use std::sync::atomic::Ordering;
        if !self.ensure_current() {
            return;
        }
        let Some(chunk) = self.current.as_ref() else {
            return;
        };
        let chunk_len = chunk.pcm.len();
        self.current_offset = (self.current_offset + self.frame_size).min(chunk_len);
        self.cursor.advance(1, self.format.sample_rate);
        if self.current_offset >= chunk_len {
            self.finish_current();
        }
        self.shared
            .server_cursor_us
            .store(self.cursor.us, Ordering::Release);
    }

    /// Chemin lent : segments de frames normales entrecoupés d'événements
    /// de correction. Un drop lit deux frames d'entrée et émet la frame
    /// précédente ; un insert n'en lit aucune et émet la frame précédente.
    fn render_with_corrections(&mut self, out: &mut [u8], insert_every: i64, drop_every: i64) {
        use std::sync::atomic::Ordering;
        let fs = self.frame_size;

        if self.insert_countdown <= 0 && insert_every > 0 {
            self.insert_countdown = insert_every;
        }
        if self.drop_countdown <= 0 && drop_every > 0 {
            self.drop_countdown = drop_every;
        }
        if !self.has_last_frame {
            self.last_frame[..fs].fill(0);
            self.has_last_frame = true;
        }

        let mut insert_counter = self.insert_countdown;
        let mut drop_counter = self.drop_countdown;
        let mut frames_remaining = (out.len() / fs) as i64;
        let mut offset = 0usize;

        while frames_remaining > 0 {
            let until_insert = if insert_every > 0 {
                insert_counter
            } else {
                frames_remaining + 1
            };
            let until_drop = if drop_every > 0 {
                drop_counter
            } else {
                frames_remaining + 1
            };
            let next_event_in = until_insert.min(until_drop).min(frames_remaining);

            if next_event_in > 0 {
                let segment = next_event_in as usize * fs;
                self.read_bulk(&mut out[offset..offset + segment]);
                offset += segment;
                frames_remaining -= next_event_in;
                insert_counter -= next_event_in;
                drop_counter -= next_event_in;
            }

            if frames_remaining > 0 {
                if drop_counter <= 0 && drop_every > 0 {
                    // Drop : le curseur avance de deux frames d'entrée pour
                    // une seule frame émise.
                    self.read_one_frame_discard();
                    self.read_one_frame_discard();
                    drop_counter = drop_every;
                    self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    out[offset..offset + fs].copy_from_slice(&self.last_frame[..fs]);
                    offset += fs;
                    frames_remaining -= 1;
                    insert_counter -= 1;
                } else if insert_counter <= 0 && insert_every > 0 {
                    // Insert : une frame émise sans rien lire, la lecture
                    // rattrape le curseur.
                    insert_counter = insert_every;
                    self.shared.frames_inserted.fetch_add(1, Ordering::Relaxed);
                    out[offset..offset + fs].copy_from_slice(&self.last_frame[..fs]);
                    offset += fs;
                    frames_remaining -= 1;
                    drop_counter -= 1;
                }
            }
        }

        self.insert_countdown = insert_counter;
        self.drop_countdown = drop_counter;
    }

    /// Jette des frames d'entrée pour réduire rapidement la profondeur de
    /// buffer (avance rapide de la porte de départ).
    fn skip_input_frames(&mut self, mut frames_to_skip: i64) {
        use std::sync::atomic::Ordering;
        while frames_to_skip > 0 {
            if !self.ensure_current() {
                break;
            }
            let Some(chunk) = self.current.as_ref() else {
                break;
            };
            let chunk_len = chunk.pcm.len();
            let remaining_frames = ((chunk_len - self.current_offset) / self.frame_size) as i64;
            if remaining_frames <= 0 {
                self.finish_current();
                continue;
            }
            let take = remaining_frames.min(frames_to_skip);
            self.current_offset += take as usize * self.frame_size;
            self.cursor.advance(take, self.format.sample_rate);
            frames_to_skip -= take;
            if self.current_offset >= chunk_len {
                self.finish_current();
            }
        }
        self.shared
            .server_cursor_us
            .store(self.cursor.us, Ordering::Release);
    }

    /// Mise à l'échelle du volume, appliquée en dernier sur tout le buffer.
    /// À 100 la sortie est identique octet pour octet ; muet ou 0 produit
    /// du silence pur.
    fn apply_volume(&self, out: &mut [u8]) {
        use std::sync::atomic::Ordering;
        let muted = self.shared.muted.load(Ordering::Acquire);
        let level = self.shared.volume.load(Ordering::Acquire).min(100);
        if muted || level == 0 {
            out.fill(0);
            return;
        }
        if level == 100 {
            return;
        }
        // Courbe en puissance : progression perçue plus naturelle qu'une
        // échelle linéaire.
        let amplitude = (f32::from(level) / 100.0).powf(1.5);
        match self.format.bit_depth {
            crate::format::BitDepth::B16 => {
                for sample in out.chunks_exact_mut(2) {
                    let v = i16::from_le_bytes([sample[0], sample[1]]);
                    let scaled = (f32::from(v) * amplitude)
                        .round()
                        .clamp(-32_768.0, 32_767.0) as i16;
                    sample.copy_from_slice(&scaled.to_le_bytes());
                }
            }
            crate::format::BitDepth::B24 => {
                for sample in out.chunks_exact_mut(3) {
                    let ext = if sample[2] & 0x80 != 0 { 0xff } else { 0x00 };
                    let v = i32::from_le_bytes([sample[0], sample[1], sample[2], ext]);
                    let scaled = (v as f64 * f64::from(amplitude))
                        .round()
                        .clamp(-8_388_608.0, 8_388_607.0) as i32;
                    sample.copy_from_slice(&scaled.to_le_bytes()[..3]);
                }
            }
            crate::format::BitDepth::B32 => {
                for sample in out.chunks_exact_mut(4) {
                    let v = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    let scaled = (v as f64 * f64::from(amplitude))
                        .round()
                        .clamp(f64::from(i32::MIN), f64::from(i32::MAX))
                        as i32;
                    sample.copy_from_slice(&scaled.to_le_bytes());
                }
            }
        }
    }
}
