//! La boucle de session de bout en bout, sur sortie nulle : événements
//! serveur et commandes de contrôle traversent `StreamSession::run`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pmodecode::FrameCodec;
use pmoplayback::{
    BitDepth, ControlCommand, PcmFormat, ServerEvent, SessionConfig, StreamSession,
};
use pmosync::ClockMapper;

fn fmt() -> PcmFormat {
    PcmFormat {
        codec: FrameCodec::Pcm,
        sample_rate: 1_000,
        channels: 2,
        bit_depth: BitDepth::B16,
    }
}

#[test]
fn test_session_loop_applies_events_and_acknowledges_commands() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    tokio_test::block_on(async {
        let (state_tx, mut state_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (command_tx, command_rx) = mpsc::channel(8);
        let stop_token = CancellationToken::new();

        let config = SessionConfig {
            use_null_output: true,
            ..SessionConfig::default()
        };
        let session = StreamSession::new(Arc::new(ClockMapper::new()), config, state_tx);
        let handle = tokio::spawn(session.run(event_rx, command_rx, stop_token.clone()));

        event_tx
            .send(ServerEvent::FormatChange { format: fmt() })
            .await
            .unwrap();
        event_tx
            .send(ServerEvent::AudioChunk {
                server_ts_us: 10_000_000,
                payload: Bytes::from_static(&[0x11u8; 40]),
            })
            .await
            .unwrap();
        command_tx
            .send(ControlCommand::SetVolume(42))
            .await
            .unwrap();

        // La commande volume est accusée par un état joueur.
        let update = state_rx.recv().await.unwrap();
        assert_eq!(update.volume, 42);
        assert!(!update.muted);

        stop_token.cancel();
        handle.await.unwrap().unwrap();
    });
}

#[test]
fn test_session_loop_stops_when_event_channel_closes() {
    tracing_subscriber::fmt().with_test_writer().try_init().ok();

    tokio_test::block_on(async {
        let (state_tx, _state_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let (_command_tx, command_rx) = mpsc::channel::<ControlCommand>(8);

        let config = SessionConfig {
            use_null_output: true,
            ..SessionConfig::default()
        };
        let session = StreamSession::new(Arc::new(ClockMapper::new()), config, state_tx);
        let handle = tokio::spawn(session.run(event_rx, command_rx, CancellationToken::new()));

        drop(event_tx);
        handle.await.unwrap().unwrap();
    });
}
