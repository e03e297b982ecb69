//! Glue de cycle de vie entre le transport et le moteur de lecture
//!
//! [`StreamSession`] consomme les messages du serveur (chunks, début/fin de
//! stream, changement de format, mises à jour d'horloge) et les commandes
//! du contexte de contrôle (volume, mute, délai statique). Elle possède le
//! décodeur, le lecteur et les réglages persistés ; après chaque commande
//! volume/mute appliquée, elle émet un [`PlayerStateUpdate`] en accusé.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pmodecode::FrameDecoder;
use pmosync::ClockMapper;

use crate::callback::CallbackCore;
use crate::device::{CpalOutput, NullOutput};
use crate::error::PlaybackError;
use crate::format::PcmFormat;
use crate::player::SyncPlayer;
use crate::settings::PlayerSettings;
use crate::state::PlaybackState;

/// Rôles annoncés par le serveur dans les messages de fin/purge de stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Controller,
    Metadata,
}

/// Messages entrants, dans l'ordre de livraison du transport.
#[derive(Debug)]
pub enum ServerEvent {
    AudioChunk {
        server_ts_us: i64,
        payload: Bytes,
    },
    StreamStart {
        codec_header: Option<Bytes>,
    },
    StreamEnd {
        roles: Option<Vec<Role>>,
    },
    StreamClear {
        roles: Option<Vec<Role>>,
    },
    FormatChange {
        format: PcmFormat,
    },
    ClockUpdate {
        offset_us: i64,
        skew_ppm: f64,
        static_delay_ms: f64,
    },
}

/// Commandes issues du contexte de contrôle (UI, CLI, serveur).
#[derive(Debug, Clone, Copy)]
pub enum ControlCommand {
    SetVolume(u8),
    SetMute(bool),
    SetStaticDelayMs(f64),
}

/// État émis vers le serveur après chaque commande volume/mute appliquée.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlayerStateUpdate {
    pub state: PlaybackState,
    pub volume: u8,
    pub muted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Périphérique de sortie par nom ; `None` = défaut système.
    pub device_name: Option<String>,
    /// Sortie nulle : le cœur de callback est conservé par la session au
    /// lieu d'être branché sur cpal.
    pub use_null_output: bool,
    /// Fichier de réglages persistés ; `None` = pas de persistance.
    pub settings_path: Option<PathBuf>,
}

pub struct StreamSession {
    config: SessionConfig,
    clock: Arc<ClockMapper>,
    decoder: FrameDecoder,
    codec_header: Option<Bytes>,
    format: Option<PcmFormat>,
    player: Option<SyncPlayer>,
    /// Cœur de callback conservé en mode sortie nulle.
    null_core: Option<CallbackCore>,
    settings: PlayerSettings,
    state_tx: mpsc::Sender<PlayerStateUpdate>,
}

impl StreamSession {
    pub fn new(
        clock: Arc<ClockMapper>,
        config: SessionConfig,
        state_tx: mpsc::Sender<PlayerStateUpdate>,
    ) -> Self {
        let settings = config
            .settings_path
            .as_deref()
            .map(PlayerSettings::load)
            .unwrap_or_default();
        clock.set_static_delay_ms(settings.static_delay_ms);
        Self {
            config,
            clock,
            decoder: FrameDecoder::new(),
            codec_header: None,
            format: None,
            player: None,
            null_core: None,
            settings,
            state_tx,
        }
    }

    /// Boucle de session : consomme événements serveur et commandes de
    /// contrôle jusqu'à fermeture des channels ou annulation.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        mut commands: mpsc::Receiver<ControlCommand>,
        stop_token: CancellationToken,
    ) -> Result<(), PlaybackError> {
        tracing::debug!("stream session started");
        let mut commands_open = true;
        loop {
            tokio::select! {
                _ = stop_token.cancelled() => {
                    tracing::debug!("stream session cancelled");
                    break;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event)?,
                        None => {
                            tracing::debug!("server event channel closed");
                            break;
                        }
                    }
                }
                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => commands_open = false,
                    }
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Applique un message du serveur.
    pub fn handle_event(&mut self, event: ServerEvent) -> Result<(), PlaybackError> {
        match event {
            ServerEvent::AudioChunk {
                server_ts_us,
                payload,
            } => {
                let Some(player) = self.player.as_mut() else {
                    tracing::debug!("audio chunk before format change; dropping");
                    return Ok(());
                };
                let pcm = self.decoder.decode(&payload);
                player.submit(server_ts_us, pcm)?;
            }
            ServerEvent::StreamStart { codec_header } => {
                self.codec_header = codec_header;
                if let Some(format) = self.format {
                    self.decoder.reconfigure(
                        format.codec,
                        format.sample_rate,
                        format.channels,
                        format.bit_depth.bits() as u8,
                        self.codec_header.clone(),
                    )?;
                }
                // Purge du contenu périmé sans perdre la calibration.
                if let Some(player) = self.player.as_mut() {
                    player.clear_queue();
                    tracing::debug!("cleared audio queue on stream start");
                }
            }
            ServerEvent::StreamEnd { roles } => {
                if targets_player(&roles) {
                    if let Some(player) = self.player.as_mut() {
                        player.clear_queue();
                        tracing::debug!("cleared audio queue on stream end");
                    }
                }
            }
            ServerEvent::StreamClear { roles } => {
                if targets_player(&roles) {
                    if let Some(player) = self.player.as_mut() {
                        player.clear_queue();
                        tracing::debug!("cleared audio queue on stream clear");
                    }
                }
            }
            ServerEvent::FormatChange { format } => {
                self.reconfigure(format)?;
            }
            ServerEvent::ClockUpdate {
                offset_us,
                skew_ppm,
                static_delay_ms,
            } => {
                self.clock.update(offset_us, skew_ppm, static_delay_ms);
            }
        }
        Ok(())
    }

    /// Applique une commande de contrôle et accuse réception.
    pub fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetVolume(volume) => {
                self.settings.set_volume(volume);
                self.apply_volume();
                self.persist_settings();
                self.emit_state();
            }
            ControlCommand::SetMute(muted) => {
                self.settings.player_muted = muted;
                self.apply_volume();
                self.persist_settings();
                self.emit_state();
            }
            ControlCommand::SetStaticDelayMs(delay_ms) => {
                self.settings.static_delay_ms = delay_ms;
                self.clock.set_static_delay_ms(delay_ms);
                self.persist_settings();
            }
        }
    }

    /// Reconfiguration complète sur changement de format : arrêt du
    /// périphérique, décodeur et file jetés, machine à états réinitialisée,
    /// reprise au prochain chunk.
    fn reconfigure(&mut self, format: PcmFormat) -> Result<(), PlaybackError> {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        self.null_core = None;

        self.decoder.reconfigure(
            format.codec,
            format.sample_rate,
            format.channels,
            format.bit_depth.bits() as u8,
            self.codec_header.clone(),
        )?;

        let (mut player, core) = SyncPlayer::new(format, self.clock.clone())?;
        if self.config.use_null_output {
            player.attach_output(Box::new(NullOutput));
            self.null_core = Some(core);
        } else {
            let output = CpalOutput::open(format, self.config.device_name.clone(), core)?;
            player.attach_output(Box::new(output));
        }
        player.set_volume(self.settings.player_volume, self.settings.player_muted);

        tracing::info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            bits = format.bit_depth.bits(),
            "player reconfigured"
        );
        self.format = Some(format);
        self.player = Some(player);
        Ok(())
    }

    fn apply_volume(&mut self) {
        if let Some(player) = self.player.as_ref() {
            player.set_volume(self.settings.player_volume, self.settings.player_muted);
        }
    }

    fn persist_settings(&self) {
        if let Some(path) = self.config.settings_path.as_deref() {
            if let Err(err) = self.settings.save(path) {
                tracing::warn!("could not persist settings to {}: {err}", path.display());
            }
        }
    }

    fn emit_state(&self) {
        let update = PlayerStateUpdate {
            state: self
                .player
                .as_ref()
                .map(SyncPlayer::state)
                .unwrap_or(PlaybackState::Initializing),
            volume: self.settings.player_volume,
            muted: self.settings.player_muted,
        };
        if self.state_tx.try_send(update).is_err() {
            tracing::debug!("player state channel full or closed; update dropped");
        }
    }

    /// Cœur de callback en mode sortie nulle, pour pilotage manuel.
    pub fn take_callback_core(&mut self) -> Option<CallbackCore> {
        self.null_core.take()
    }

    pub fn player(&self) -> Option<&SyncPlayer> {
        self.player.as_ref()
    }

    pub fn settings(&self) -> &PlayerSettings {
        &self.settings
    }

    fn shutdown(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.stop();
        }
        self.null_core = None;
    }
}

fn targets_player(roles: &Option<Vec<Role>>) -> bool {
    match roles {
        None => true,
        Some(roles) => roles.contains(&Role::Player),
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
            sample_rate: 1_000,
            channels: 2,
            bit_depth: BitDepth::B16,
        }
    }

    fn new_session() -> (StreamSession, mpsc::Receiver<PlayerStateUpdate>) {
        let (state_tx, state_rx) = mpsc::channel(8);
        let config = SessionConfig {
            use_null_output: true,
            ..SessionConfig::default()
        };
        (
            StreamSession::new(Arc::new(ClockMapper::new()), config, state_tx),
            state_rx,
        )
    }

    #[test]
    fn test_chunk_before_format_is_dropped() {
        let (mut session, _state_rx) = new_session();
        session
            .handle_event(ServerEvent::AudioChunk {
                server_ts_us: 0,
                payload: Bytes::from_static(&[0u8; 8]),
            })
            .unwrap();
        assert!(session.player().is_none());
    }

    #[test]
    fn test_format_change_builds_player() {
        let (mut session, _state_rx) = new_session();
        session
            .handle_event(ServerEvent::FormatChange { format: fmt() })
            .unwrap();
        assert!(session.player().is_some());
        assert!(session.take_callback_core().is_some());

        session
            .handle_event(ServerEvent::AudioChunk {
                server_ts_us: 10_000_000,
                payload: Bytes::from_static(&[0u8; 40]),
            })
            .unwrap();
        assert_eq!(
            session.player().unwrap().state(),
            PlaybackState::WaitingForStart
        );
    }

    #[test]
    fn test_volume_command_emits_state_update() {
        let (mut session, mut state_rx) = new_session();
        session
            .handle_event(ServerEvent::FormatChange { format: fmt() })
            .unwrap();
        session.handle_command(ControlCommand::SetVolume(60));

        let update = state_rx.try_recv().unwrap();
        assert_eq!(update.volume, 60);
        assert!(!update.muted);
        assert_eq!(session.player().unwrap().volume(), 60);
    }

    #[test]
    fn test_mute_command_preserves_volume() {
        let (mut session, mut state_rx) = new_session();
        session
            .handle_event(ServerEvent::FormatChange { format: fmt() })
            .unwrap();
        session.handle_command(ControlCommand::SetVolume(60));
        let _ = state_rx.try_recv();
        session.handle_command(ControlCommand::SetMute(true));

        let update = state_rx.try_recv().unwrap();
        assert_eq!(update.volume, 60);
        assert!(update.muted);
    }

    #[test]
    fn test_stream_end_for_other_role_keeps_queue() {
        let (mut session, _state_rx) = new_session();
        session
            .handle_event(ServerEvent::FormatChange { format: fmt() })
            .unwrap();
        session
            .handle_event(ServerEvent::AudioChunk {
                server_ts_us: 10_000_000,
                payload: Bytes::from_static(&[1u8; 40]),
            })
            .unwrap();
        let buffered = session.player().unwrap().timing_metrics().buffered_audio_us;
        assert!(buffered > 0);

        session
            .handle_event(ServerEvent::StreamEnd {
                roles: Some(vec![Role::Controller]),
            })
            .unwrap();
        assert_eq!(
            session.player().unwrap().timing_metrics().buffered_audio_us,
            buffered
        );

        session
            .handle_event(ServerEvent::StreamEnd { roles: None })
            .unwrap();
        assert_eq!(
            session.player().unwrap().timing_metrics().buffered_audio_us,
            0
        );
    }

    #[test]
    fn test_clock_update_reaches_mapper() {
        let (mut session, _state_rx) = new_session();
        session
            .handle_event(ServerEvent::ClockUpdate {
                offset_us: 1_000,
                skew_ppm: 0.0,
                static_delay_ms: 0.0,
            })
            .unwrap();
        assert_eq!(session.clock.to_client(0), 1_000);
    }

    #[test]
    fn test_static_delay_command_updates_clock() {
        let (mut session, _state_rx) = new_session();
        session.handle_command(ControlCommand::SetStaticDelayMs(30.0));
        assert_eq!(session.clock.static_delay_ms(), 30.0);
        assert_eq!(session.settings().static_delay_ms, 30.0);
    }
}
