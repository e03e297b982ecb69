//! Tests d'intégration de la porte de départ
//!
//! Le cœur de callback est piloté à la main avec une timeline DAC = hôte
//! (calibration parfaite) et un mapper d'horloge à offset constant.

use std::sync::Arc;

use pmodecode::FrameCodec;
use pmoplayback::{
    BitDepth, CallbackCore, CallbackStatus, PcmFormat, PlaybackState, SyncPlayer,
};
use pmosync::ClockMapper;

const BUFFER_FRAMES: usize = 2048;
const FRAME_SIZE: usize = 4; // stéréo 16 bits

fn cd_format() -> PcmFormat {
    PcmFormat {
        codec: FrameCodec::Pcm,
        sample_rate: 44_100,
        channels: 2,
        bit_depth: BitDepth::B16,
    }
}

fn make_player(clock_offset_us: i64) -> (SyncPlayer, CallbackCore, Arc<ClockMapper>) {
    let clock = Arc::new(ClockMapper::new());
    clock.update(clock_offset_us, 0.0, 0.0);
    let (player, core) = SyncPlayer::new(cd_format(), clock.clone()).unwrap();
    (player, core, clock)
}

/// Frames stéréo i16 dont la valeur encode l'index global (décalé de 1
/// pour rester non nulles).
fn pattern_frames(start: usize, count: usize) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(count * FRAME_SIZE);
    for i in 0..count {
        let value = ((start + i) % 30_000 + 1) as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

fn buffer_start_host(render_start_us: i64, buffer_index: usize) -> i64 {
    render_start_us
        + (buffer_index as f64 * BUFFER_FRAMES as f64 * 1e6 / 44_100.0).round() as i64
}

#[test]
fn test_clean_start_aligns_first_sample_and_streams_bit_exact() {
    let (mut player, mut core, _clock) = make_player(0);
    let format = cd_format();

    // 50 chunks contigus de 960 frames à partir de ts = 10 s.
    let mut ts = 10_000_000i64;
    let mut frame_index = 0usize;
    for _ in 0..50 {
        player
            .submit_at(0, ts, pattern_frames(frame_index, 960))
            .unwrap();
        frame_index += 960;
        ts += format.duration_us(960);
    }
    assert_eq!(player.state(), PlaybackState::WaitingForStart);

    // Rendu à partir de 9 s : une seconde de silence, puis le contenu.
    let render_start = 9_000_000i64;
    let mut output = Vec::new();
    let mut buffer_index = 0usize;
    while output.len() < 3 * 44_100 * FRAME_SIZE {
        let host = buffer_start_host(render_start, buffer_index);
        let mut buf = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
        core.render(&mut buf, Some(host), host, CallbackStatus::default());
        output.extend_from_slice(&buf);
        buffer_index += 1;
    }
    assert_eq!(player.state(), PlaybackState::Playing);

    // Le premier frame réel correspond au ts serveur du premier chunk, à
    // ±1 frame près : exactement 1 s après le début du rendu.
    let first_real = output
        .chunks_exact(FRAME_SIZE)
        .position(|frame| frame.iter().any(|&b| b != 0))
        .expect("no real audio found");
    assert!(
        (first_real as i64 - 44_100).abs() <= 1,
        "first real frame at {first_real}"
    );

    // La seconde suivante est identique octet pour octet à l'entrée.
    let got = &output[first_real * FRAME_SIZE..(first_real + 44_100) * FRAME_SIZE];
    let want = pattern_frames(0, 44_100);
    assert_eq!(got, &want[..]);
}

#[test]
fn test_waiting_buffers_are_pure_silence() {
    let (mut player, mut core, _clock) = make_player(0);
    player
        .submit_at(0, 60_000_000, pattern_frames(0, 960))
        .unwrap();

    // Cible à 60 s : tout buffer rendu avant reste silencieux.
    for buffer_index in 0..10 {
        let host = buffer_start_host(1_000_000, buffer_index);
        let mut buf = vec![0xffu8; BUFFER_FRAMES * FRAME_SIZE];
        core.render(&mut buf, Some(host), host, CallbackStatus::default());
        assert!(buf.iter().all(|&b| b == 0));
    }
    assert_eq!(player.state(), PlaybackState::WaitingForStart);
}

#[test]
fn test_late_target_fast_forwards_under_dac_gating() {
    let (mut player, mut core, _clock) = make_player(0);
    let format = cd_format();

    // Démarrage planifié à 10 s, lecture rendue seulement à partir de
    // 10,5 s : 0,5 s de contenu doit être sauté.
    let mut ts = 10_000_000i64;
    let mut frame_index = 0usize;
    for _ in 0..50 {
        player
            .submit_at(0, ts, pattern_frames(frame_index, 960))
            .unwrap();
        frame_index += 960;
        ts += format.duration_us(960);
    }

    // Une calibration antérieure pour ancrer la cible DAC.
    let mut warmup = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
    core.render(&mut warmup, Some(9_000_000), 9_000_000, CallbackStatus::default());

    let host = 10_500_000i64;
    let mut buf = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
    core.render(&mut buf, Some(host), host, CallbackStatus::default());
    assert_eq!(player.state(), PlaybackState::Playing);

    // Le premier frame du buffer doit venir ~0,5 s dans le contenu.
    let first = i16::from_le_bytes([buf[0], buf[1]]);
    let expected = (22_050 % 30_000 + 1) as i16;
    assert!(
        (i32::from(first) - i32::from(expected)).abs() <= 2,
        "first sample {first}, expected ~{expected}"
    );
}

#[test]
fn test_monotonic_gating_declines_fast_forward() {
    let (mut player, mut core, _clock) = make_player(0);
    player
        .submit_at(0, 10_000_000, pattern_frames(0, 4_800))
        .unwrap();

    // Pas de temps DAC : porte purement monotone, cible déjà passée. La
    // lecture s'arme sans avance rapide.
    let mut buf = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
    core.render(&mut buf, None, 10_500_000, CallbackStatus::default());
    assert_eq!(player.state(), PlaybackState::Playing);

    // Le contenu démarre au tout début du stream, rien n'a été sauté.
    let first = i16::from_le_bytes([buf[0], buf[1]]);
    assert_eq!(first, 1);
}

#[test]
fn test_early_start_suspect_blocks_fast_forward() {
    let (mut player, mut core, _clock) = make_player(0);

    // Démarrage planifié 0,1 s après « maintenant » : suspect.
    player
        .submit_at(9_950_000, 10_050_000, pattern_frames(0, 4_800))
        .unwrap();

    let mut warmup = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
    core.render(&mut warmup, Some(9_990_000), 9_990_000, CallbackStatus::default());

    // Cible dépassée sous porte DAC, mais le soupçon de démarrage précoce
    // interdit l'avance rapide : le contenu démarre à son premier frame.
    let mut buf = vec![0u8; BUFFER_FRAMES * FRAME_SIZE];
    core.render(&mut buf, Some(10_500_000), 10_500_000, CallbackStatus::default());
    assert_eq!(player.state(), PlaybackState::Playing);
    let first = i16::from_le_bytes([buf[0], buf[1]]);
    assert_eq!(first, 1);
}
