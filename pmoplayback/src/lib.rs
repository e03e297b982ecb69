#![doc = r#"
PMOPlayback - Moteur de lecture audio synchronisée multiroom

Cette crate implémente le côté client d'un système de streaming multiroom :
elle reçoit des chunks PCM (ou FLAC) horodatés par le serveur et les rend
sur la sortie audio locale de façon à ce que tous les lecteurs d'un même
groupe soient acoustiquement alignés à quelques millisecondes près, malgré
la gigue réseau, les quartz indépendants et le buffering variable de l'OS.

# Architecture

```text
transport ─▶ (décodage) ─▶ file de chunks ─▶ porte de départ ─▶ callback ─▶ DAC
                 ▲                                                  │
                 │      calibration DAC ↔ hôte ◀────────────────────┘
                 │                │
          correcteur de synchro ◀─┘ (cadence insert/drop)
```

Trois contextes d'exécution coopèrent :

- **producteur** (tâche tokio) : décodage, normalisation gap/recouvrement,
  planification du démarrage, correcteur de synchro
- **callback audio** (thread temps-réel du pilote) : lecture de la file,
  corrections insert/drop, volume — sans allocation ni lock
- **contrôle** : volume, mute et délai statique via des atomiques

La seule communication du callback vers le producteur est le drapeau
`clear_requested` levé après un underflow ; dans l'autre sens, des époques
atomiques signalent les purges de file.
"#]

mod callback;
mod corrector;
mod error;
mod format;
mod player;
mod queue;
mod session;
mod state;

pub mod device;
pub mod settings;

pub use callback::{CallbackCore, CallbackStatus};
pub use device::{query_devices, AudioDeviceInfo, CpalOutput, NullOutput, OutputControl};
pub use error::PlaybackError;
pub use format::{BitDepth, PcmFormat};
pub use player::{SyncPlayer, TimingMetrics};
pub use queue::QueuedChunk;
pub use session::{
    ControlCommand, PlayerStateUpdate, Role, ServerEvent, SessionConfig, StreamSession,
};
pub use settings::PlayerSettings;
pub use state::PlaybackState;

pub use pmodecode::{FrameCodec, FrameDecoder};
