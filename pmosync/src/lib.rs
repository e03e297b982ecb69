#![doc = r#"
PMOSync - Primitives temporelles pour la lecture multiroom synchronisée

Cette crate regroupe les outils de conversion entre les trois échelles de
temps manipulées par le lecteur synchronisé :

- **Temps serveur** : horodatages µs posés par le serveur sur chaque chunk
- **Temps hôte** : horloge monotone locale, en µs
- **Temps DAC** : horloge du pilote audio, représentant l'instant de
  conversion analogique d'un échantillon

# Composition des mappings

```text
serveur ──ClockMapper──▶ hôte ──DacCalibrator──▶ DAC
        ◀──────────────       ◀────────────────
```

Les deux mappings sont quasi-identitaires (pente clampée autour de 1.0), ce
qui borne l'erreur d'extrapolation lors des glitchs transitoires.

Tous les types de cette crate sont utilisables depuis le callback audio
temps-réel : aucune allocation, aucun lock bloquant, arithmétique pure sur
des atomiques.
"#]

mod calibration;
mod clock;
mod filter;
mod host_clock;
mod seq;

pub use calibration::{CalibrationSnapshot, DacCalibrator, CALIBRATION_RING};
pub use clock::ClockMapper;
pub use filter::TimeFilter;
pub use host_clock::host_now_us;
pub use seq::SeqLock;

/// Facteur de conversion secondes → microsecondes.
pub const MICROS_PER_SECOND: i64 = 1_000_000;
