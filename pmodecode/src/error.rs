#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("unsupported bit depth: {0} (expected 16, 24 or 32)")]
    UnsupportedBitDepth(u8),
    #[error("invalid channel count: {0}")]
    InvalidChannels(u8),
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}
