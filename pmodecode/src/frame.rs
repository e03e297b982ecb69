//! Codec-agnostic front door for the playback engine.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::flac::FlacFrameDecoder;

/// Wire codec of the audio chunks for the current stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// Chunks are already little-endian interleaved PCM.
    Pcm,
    /// Chunks are standalone FLAC frames.
    Flac,
}

enum Inner {
    Pcm,
    Flac(FlacFrameDecoder),
}

/// Converts incoming frames to PCM according to the session codec.
///
/// Starts as a PCM passthrough; [`reconfigure`](Self::reconfigure) swaps the
/// codec and discards any previous decoder state. Reconfiguring with the
/// same parameters is harmless.
pub struct FrameDecoder {
    inner: Inner,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { inner: Inner::Pcm }
    }

    pub fn reconfigure(
        &mut self,
        codec: FrameCodec,
        sample_rate: u32,
        channels: u8,
        bit_depth: u8,
        codec_header: Option<Bytes>,
    ) -> Result<(), DecodeError> {
        self.inner = match codec {
            FrameCodec::Pcm => Inner::Pcm,
            FrameCodec::Flac => Inner::Flac(FlacFrameDecoder::new(
                sample_rate,
                channels,
                bit_depth,
                codec_header,
            )?),
        };
        Ok(())
    }

    /// Decodes one frame; PCM input is returned unchanged. An undecodable
    /// compressed frame yields an empty payload.
    pub fn decode(&mut self, frame: &[u8]) -> Vec<u8> {
        match &self.inner {
            Inner::Pcm => frame.to_vec(),
            Inner::Flac(decoder) => decoder.decode(frame),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
