//! Per-frame audio decoding.
//!
//! The streaming server ships each audio chunk either as raw PCM or as a
//! single self-contained FLAC frame. This crate turns one such frame into
//! little-endian interleaved PCM at the declared output sample rate, channel
//! layout and bit depth. PCM input passes through unchanged.
//!
//! Decoding is strictly per-frame: every FLAC frame is prefixed with the
//! stream header (server-provided, or a synthesized minimal STREAMINFO) and
//! run through `claxon` as a tiny standalone stream. A frame that cannot be
//! decoded yields an empty payload so the playback cursor never advances on
//! bad data.

mod error;
mod flac;
mod frame;

pub use error::DecodeError;
pub use flac::FlacFrameDecoder;
pub use frame::{FrameCodec, FrameDecoder};
