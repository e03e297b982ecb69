use std::io;

#[derive(thiserror::Error, Debug)]
pub enum PlaybackError {
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device error: {0}")]
    DeviceConfig(String),
    #[error("decoder error: {0}")]
    Decoder(#[from] pmodecode::DecodeError),
    #[error("audio queue closed")]
    QueueClosed,
    #[error("settings error: {0}")]
    Settings(#[from] io::Error),
}
