//! Couche périphérique de sortie
//!
//! La sortie réelle passe par cpal. Le `Stream` cpal n'étant pas `Send`, il
//! vit dans un thread dédié commandé par un channel std ; le reste du
//! moteur ne manipule qu'une poignée [`CpalOutput`]. Une sortie nulle est
//! fournie pour les machines sans carte audio.

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use crate::callback::{CallbackCore, CallbackStatus};
use crate::error::PlaybackError;
use crate::format::{BitDepth, PcmFormat};

/// Taille de bloc visée : ~46 ms à 44,1 kHz. Le pilote reste libre de la
/// découper autrement ; le cœur s'accommode de toute taille de buffer.
pub const BLOCK_SIZE_FRAMES: u32 = 2048;

/// Un périphérique de sortie audio énuméré.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub output_channels: u16,
    pub sample_rate: u32,
    pub is_default: bool,
}

/// Énumère les périphériques de sortie disponibles.
pub fn query_devices() -> Result<Vec<AudioDeviceInfo>, PlaybackError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let devices = host
        .output_devices()
        .map_err(|e| PlaybackError::DeviceConfig(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let Ok(config) = device.default_output_config() else {
            continue;
        };
        if config.channels() == 0 {
            continue;
        }
        result.push(AudioDeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            output_channels: config.channels(),
            sample_rate: config.sample_rate().0,
        });
    }
    Ok(result)
}

/// Contrôle du flux de sortie, côté producteur.
pub trait OutputControl: Send {
    fn start(&mut self) -> Result<(), PlaybackError>;
    fn stop(&mut self);
}

/// Sortie nulle : aucun périphérique requis, le cœur est piloté à la main.
pub struct NullOutput;

impl OutputControl for NullOutput {
    fn start(&mut self) -> Result<(), PlaybackError> {
        tracing::debug!("null audio output started (no playback)");
        Ok(())
    }

    fn stop(&mut self) {}
}

enum StreamCommand {
    Start(std_mpsc::Sender<Result<(), String>>),
    Stop,
    Shutdown,
}

/// Poignée du thread propriétaire du stream cpal.
pub struct CpalOutput {
    cmd_tx: std_mpsc::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Ouvre le périphérique demandé (ou celui par défaut) au format exact
    /// de la session et y branche le cœur de callback. Le flux reste en
    /// pause jusqu'à [`OutputControl::start`].
    pub fn open(
        format: PcmFormat,
        device_name: Option<String>,
        core: CallbackCore,
    ) -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread = thread::Builder::new()
            .name("pmo-audio-output".into())
            .spawn(move || output_thread(format, device_name, core, cmd_rx, ready_tx))
            .map_err(|e| PlaybackError::DeviceConfig(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(PlaybackError::DeviceConfig(
                "audio output thread terminated during setup".into(),
            )),
        }
    }
}

impl OutputControl for CpalOutput {
    fn start(&mut self) -> Result<(), PlaybackError> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.cmd_tx
            .send(StreamCommand::Start(reply_tx))
            .map_err(|_| PlaybackError::DeviceConfig("audio output thread is gone".into()))?;
        match reply_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(PlaybackError::DeviceConfig(err)),
            Err(_) => Err(PlaybackError::DeviceConfig(
                "audio output thread is gone".into(),
            )),
        }
    }

    fn stop(&mut self) {
        let _ = self.cmd_tx.send(StreamCommand::Stop);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(StreamCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn output_thread(
    format: PcmFormat,
    device_name: Option<String>,
    core: CallbackCore,
    cmd_rx: std_mpsc::Receiver<StreamCommand>,
    ready_tx: std_mpsc::Sender<Result<(), PlaybackError>>,
) {
    let stream = match build_stream(&format, device_name.as_deref(), core) {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    while let Ok(command) = cmd_rx.recv() {
        match command {
            StreamCommand::Start(reply) => {
                let result = stream.play().map_err(|e| e.to_string());
                if let Err(ref err) = result {
                    tracing::error!("failed to start output stream: {err}");
                }
                let _ = reply.send(result);
            }
            StreamCommand::Stop => {
                if let Err(err) = stream.pause() {
                    tracing::warn!("failed to pause output stream: {err}");
                }
            }
            StreamCommand::Shutdown => break,
        }
    }
    tracing::debug!("audio output thread exiting");
    // Le stream est fermé en sortant du thread.
}

fn select_device(device_name: Option<&str>) -> Result<cpal::Device, PlaybackError> {
    let host = cpal::default_host();
    match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| PlaybackError::DeviceConfig(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| {
                PlaybackError::DeviceConfig(format!("output device '{name}' not found"))
            }),
        None => host
            .default_output_device()
            .ok_or_else(|| PlaybackError::DeviceConfig("no output device available".into())),
    }
}

fn build_stream(
    format: &PcmFormat,
    device_name: Option<&str>,
    core: CallbackCore,
) -> Result<cpal::Stream, PlaybackError> {
    let device = select_device(device_name)?;

    if let Ok(default) = device.default_output_config() {
        if default.sample_rate().0 != format.sample_rate
            || default.channels() != u16::from(format.channels)
        {
            tracing::warn!(
                requested_rate = format.sample_rate,
                requested_channels = format.channels,
                device_rate = default.sample_rate().0,
                device_channels = default.channels(),
                "requested format differs from device default"
            );
        }
    }

    let config = StreamConfig {
        channels: u16::from(format.channels),
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    tracing::info!(
        device = device.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate = format.sample_rate,
        channels = format.channels,
        bits = format.bit_depth.bits(),
        "opening output stream"
    );

    let err_fn = |err: cpal::StreamError| {
        tracing::error!("audio stream error: {err}");
    };

    let stream = match format.bit_depth {
        BitDepth::B16 => {
            let mut core = core;
            let mut epoch: Option<cpal::StreamInstant> = None;
            device.build_output_stream(
                &config,
                move |data: &mut [i16], info: &cpal::OutputCallbackInfo| {
                    let host_us = pmosync::host_now_us();
                    let dac_us = dac_time_us(&mut epoch, info);
                    let status = CallbackStatus {
                        underflow: core.starved(),
                    };
                    let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
                    core.render(bytes, dac_us, host_us, status);
                },
                err_fn,
                None,
            )
        }
        BitDepth::B32 => {
            let mut core = core;
            let mut epoch: Option<cpal::StreamInstant> = None;
            device.build_output_stream(
                &config,
                move |data: &mut [i32], info: &cpal::OutputCallbackInfo| {
                    let host_us = pmosync::host_now_us();
                    let dac_us = dac_time_us(&mut epoch, info);
                    let status = CallbackStatus {
                        underflow: core.starved(),
                    };
                    let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
                    core.render(bytes, dac_us, host_us, status);
                },
                err_fn,
                None,
            )
        }
        BitDepth::B24 => {
            // Pas de format 24 bits packé côté cpal : le cœur produit ses
            // frames de 3 octets dans un tampon intermédiaire, élargies
            // ensuite vers le flux I32.
            let mut core = core;
            let mut epoch: Option<cpal::StreamInstant> = None;
            let mut scratch: Vec<u8> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i32], info: &cpal::OutputCallbackInfo| {
                    let host_us = pmosync::host_now_us();
                    let dac_us = dac_time_us(&mut epoch, info);
                    let status = CallbackStatus {
                        underflow: core.starved(),
                    };
                    let needed = data.len() * 3;
                    if scratch.len() < needed {
                        scratch.resize(needed, 0);
                    }
                    core.render(&mut scratch[..needed], dac_us, host_us, status);
                    for (sample, src) in data.iter_mut().zip(scratch.chunks_exact(3)) {
                        // 24 bits signés, cadrés à gauche dans l'échelle I32.
                        *sample = i32::from_le_bytes([0, src[0], src[1], src[2]]);
                    }
                },
                err_fn,
                None,
            )
        }
    };

    stream.map_err(|err| match err {
        cpal::BuildStreamError::StreamConfigNotSupported => PlaybackError::UnsupportedFormat(
            format!(
                "{} Hz / {} ch / {} bits",
                format.sample_rate,
                format.channels,
                format.bit_depth.bits()
            ),
        ),
        other => PlaybackError::DeviceConfig(other.to_string()),
    })
}

/// Temps DAC en µs du premier échantillon du buffer, relatif au premier
/// instant de callback observé. L'origine arbitraire est absorbée par la
/// calibration DAC ↔ hôte.
fn dac_time_us(
    epoch: &mut Option<cpal::StreamInstant>,
    info: &cpal::OutputCallbackInfo,
) -> Option<i64> {
    let timestamp = info.timestamp();
    let epoch_instant = *epoch.get_or_insert(timestamp.callback);
    timestamp
        .playback
        .duration_since(&epoch_instant)
        .map(|d| d.as_micros() as i64)
}
