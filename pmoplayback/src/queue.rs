//! File de chunks et normalisation gap/recouvrement
//!
//! La file est un channel borné `crossbeam-channel` : le producteur pousse,
//! le callback audio consomme via `try_recv` (lock-free, sans allocation).
//! Le producteur garde un clone du récepteur pour les purges différées.
//!
//! Avant insertion, chaque chunk passe par le [`Normalizer`] qui garantit
//! les invariants de la file : horodatages strictement croissants, chunks
//! adjacents exactement contigus (tout trou réel est matérialisé en chunk
//! de silence, tout recouvrement est rogné).

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::format::PcmFormat;

/// Capacité de la file en chunks (~10-25 s de contenu aux cadences
/// usuelles). `submit` ne bloque jamais : au-delà, le chunk est jeté.
pub(crate) const QUEUE_CAPACITY_CHUNKS: usize = 512;

/// Un lot de frames soumis atomiquement avec un horodatage serveur unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedChunk {
    /// Horodatage serveur, en µs, du premier échantillon du chunk.
    pub server_ts_us: i64,
    /// PCM entrelacé little-endian, longueur multiple de la taille de
    /// frame.
    pub pcm: Vec<u8>,
}

pub(crate) fn chunk_channel() -> (Sender<QueuedChunk>, Receiver<QueuedChunk>) {
    bounded(QUEUE_CAPACITY_CHUNKS)
}

/// Résultat de la normalisation d'une soumission : un éventuel chunk de
/// silence comblant un trou, puis l'éventuel chunk utile (absent si le
/// recouvrement l'a entièrement consommé ou si la charge était vide).
#[derive(Debug, Default)]
pub(crate) struct NormalizedSubmit {
    pub silence: Option<QueuedChunk>,
    pub chunk: Option<QueuedChunk>,
}

impl NormalizedSubmit {
    pub(crate) fn into_chunks(self) -> impl Iterator<Item = QueuedChunk> {
        self.silence.into_iter().chain(self.chunk)
    }
}

/// Suit l'horodatage de fin de la queue de la file et aligne chaque
/// nouvelle soumission dessus.
pub(crate) struct Normalizer {
    expected_next_us: Option<i64>,
}

impl Normalizer {
    pub(crate) fn new() -> Self {
        Self {
            expected_next_us: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.expected_next_us = None;
    }

    pub(crate) fn normalize(
        &mut self,
        format: &PcmFormat,
        server_ts_us: i64,
        mut pcm: Vec<u8>,
    ) -> NormalizedSubmit {
        let frame_size = format.frame_size();
        let mut out = NormalizedSubmit::default();
        let mut effective_ts = server_ts_us;

        match self.expected_next_us {
            None => {
                self.expected_next_us = Some(server_ts_us);
            }
            Some(expected) if server_ts_us > expected => {
                // Trou : matérialisé en silence pour que la file reste
                // contiguë.
                let gap_us = server_ts_us - expected;
                let gap_frames = format.frames_for_us(gap_us);
                if gap_frames > 0 {
                    tracing::debug!(gap_ms = gap_us as f64 / 1_000.0, "gap filled with silence");
                    out.silence = Some(QueuedChunk {
                        server_ts_us: expected,
                        pcm: vec![0u8; gap_frames as usize * frame_size],
                    });
                }
                self.expected_next_us = Some(server_ts_us);
            }
            Some(expected) if server_ts_us < expected => {
                // Recouvrement : rogne le début déjà joué.
                let overlap_us = expected - server_ts_us;
                let trim_bytes = format.frames_for_us(overlap_us) as usize * frame_size;
                if trim_bytes < pcm.len() {
                    pcm.drain(..trim_bytes);
                    effective_ts = expected;
                    tracing::debug!(
                        overlap_ms = overlap_us as f64 / 1_000.0,
                        "overlap trimmed"
                    );
                } else {
                    tracing::debug!(
                        overlap_ms = overlap_us as f64 / 1_000.0,
                        "chunk skipped, already played"
                    );
                    return out;
                }
            }
            Some(_) => {}
        }

        if !pcm.is_empty() {
            let frames = (pcm.len() / frame_size) as i64;
            self.expected_next_us = Some(effective_ts + format.duration_us(frames));
            out.chunk = Some(QueuedChunk {
                server_ts_us: effective_ts,
                pcm,
            });
        }
        out
    }
}
