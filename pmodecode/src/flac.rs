//! FLAC frame decoding via `claxon`.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::DecodeError;

/// STREAMINFO metadata block length in bytes.
const STREAMINFO_LEN: usize = 34;

/// Block size advertised in a synthesized STREAMINFO.
const SYNTHESIZED_BLOCK_SIZE: u16 = 4096;

/// Decoder for individual FLAC frames.
///
/// Each call to [`decode`](Self::decode) builds a minimal FLAC stream
/// (`header ‖ frame`) and decodes it with `claxon`. The header is the one
/// the server sent at stream start when available; otherwise a minimal
/// STREAMINFO is synthesized from the declared format.
///
/// Decoded samples are converted from the source bit depth reported by the
/// stream header to the declared output bit depth, little-endian
/// interleaved (24-bit packed as 3 bytes).
pub struct FlacFrameDecoder {
    header: Bytes,
    channels: u8,
    bit_depth: u8,
}

impl FlacFrameDecoder {
    pub fn new(
        sample_rate: u32,
        channels: u8,
        bit_depth: u8,
        codec_header: Option<Bytes>,
    ) -> Result<Self, DecodeError> {
        if !matches!(bit_depth, 16 | 24 | 32) {
            return Err(DecodeError::UnsupportedBitDepth(bit_depth));
        }
        if channels == 0 || channels > 8 {
            return Err(DecodeError::InvalidChannels(channels));
        }
        if sample_rate == 0 {
            return Err(DecodeError::InvalidSampleRate(sample_rate));
        }
        let header = match codec_header {
            Some(header) if !header.is_empty() => header,
            _ => {
                tracing::debug!("no codec header from server, synthesizing STREAMINFO");
                synthesize_streaminfo(sample_rate, channels, bit_depth)
            }
        };
        Ok(Self {
            header,
            channels,
            bit_depth,
        })
    }

    /// Decodes one FLAC frame to interleaved little-endian PCM.
    ///
    /// Returns an empty payload when the frame yields no samples or fails to
    /// decode; the caller treats that as a zero-length chunk.
    pub fn decode(&self, frame: &[u8]) -> Vec<u8> {
        let mut stream = Vec::with_capacity(self.header.len() + frame.len());
        stream.extend_from_slice(&self.header);
        stream.extend_from_slice(frame);

        let mut reader = match claxon::FlacReader::new(Cursor::new(stream)) {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!("FLAC frame rejected by decoder: {err}");
                return Vec::new();
            }
        };
        let src_bits = reader.streaminfo().bits_per_sample;

        let mut pcm = Vec::new();
        let mut frames = reader.blocks();
        let mut buffer = Vec::new();
        loop {
            match frames.read_next_or_eof(buffer) {
                Ok(Some(block)) => {
                    let duration = block.duration();
                    for i in 0..duration {
                        for ch in 0..u32::from(self.channels) {
                            write_sample(&mut pcm, block.sample(ch, i), src_bits, self.bit_depth);
                        }
                    }
                    buffer = block.into_buffer();
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("FLAC decode error: {err}");
                    break;
                }
            }
        }
        pcm
    }
}

/// Appends one sample to `pcm`, rescaled from `src_bits` (right-justified,
/// as produced by `claxon`) to the declared output depth.
fn write_sample(pcm: &mut Vec<u8>, sample: i32, src_bits: u32, dst_bits: u8) {
    let shift = i32::from(dst_bits) - src_bits as i32;
    let value = if shift >= 0 {
        sample << shift
    } else {
        sample >> (-shift)
    };
    match dst_bits {
        16 => pcm.extend_from_slice(&(value as i16).to_le_bytes()),
        24 => {
            let le = value.to_le_bytes();
            pcm.extend_from_slice(&le[..3]);
        }
        _ => pcm.extend_from_slice(&value.to_le_bytes()),
    }
}

/// Builds a complete FLAC header when the server did not provide one:
/// `fLaC` marker, metadata block header (last-block flag, type 0, length
/// 34), then the 34-byte STREAMINFO block with the declared format packed
/// into its 20/3/5-bit fields. Frame sizes, total samples and MD5 stay
/// zero, which FLAC readers treat as unknown.
fn synthesize_streaminfo(sample_rate: u32, channels: u8, bit_depth: u8) -> Bytes {
    let mut header = Vec::with_capacity(4 + 4 + STREAMINFO_LEN);
    header.extend_from_slice(b"fLaC");
    header.push(0x80);
    header.extend_from_slice(&(STREAMINFO_LEN as u32).to_be_bytes()[1..]);

    let mut streaminfo = [0u8; STREAMINFO_LEN];
    streaminfo[0..2].copy_from_slice(&SYNTHESIZED_BLOCK_SIZE.to_be_bytes());
    streaminfo[2..4].copy_from_slice(&SYNTHESIZED_BLOCK_SIZE.to_be_bytes());
    // sample_rate(20) | channels-1(3) | bits_per_sample-1(5) | total_samples_high(4)
    let packed = (sample_rate << 12)
        | (u32::from(channels - 1) << 9)
        | (u32::from(bit_depth - 1) << 4);
    streaminfo[10..14].copy_from_slice(&packed.to_be_bytes());

    header.extend_from_slice(&streaminfo);
    Bytes::from(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_header_layout() {
        let header = synthesize_streaminfo(44_100, 2, 16);
        assert_eq!(header.len(), 42);
        assert_eq!(&header[0..4], b"fLaC");
        // Dernier bloc de métadonnées, type STREAMINFO, longueur 34.
        assert_eq!(header[4], 0x80);
        assert_eq!(&header[5..8], &[0x00, 0x00, 0x22]);
        // Tailles de bloc min/max.
        assert_eq!(&header[8..10], &4096u16.to_be_bytes());
        assert_eq!(&header[10..12], &4096u16.to_be_bytes());
        // Champs compactés : 44100 << 12 | 1 << 9 | 15 << 4.
        let packed = u32::from_be_bytes([header[18], header[19], header[20], header[21]]);
        assert_eq!(packed >> 12, 44_100);
        assert_eq!((packed >> 9) & 0x7, 1);
        assert_eq!((packed >> 4) & 0x1f, 15);
    }

    #[test]
    fn test_rejects_invalid_format() {
        assert!(FlacFrameDecoder::new(44_100, 2, 12, None).is_err());
        assert!(FlacFrameDecoder::new(44_100, 0, 16, None).is_err());
        assert!(FlacFrameDecoder::new(0, 2, 16, None).is_err());
    }

    #[test]
    fn test_garbage_frame_decodes_to_empty() {
        let decoder = FlacFrameDecoder::new(44_100, 2, 16, None).unwrap();
        assert!(decoder.decode(&[0xde, 0xad, 0xbe, 0xef]).is_empty());
    }

    #[test]
    fn test_corrupt_header_decodes_to_empty() {
        let decoder =
            FlacFrameDecoder::new(44_100, 2, 16, Some(Bytes::from_static(b"nope"))).unwrap();
        assert!(decoder.decode(&[0u8; 16]).is_empty());
    }

    #[test]
    fn test_write_sample_widths() {
        let mut pcm = Vec::new();
        // 16 bits source vers 16 bits cible : identité.
        write_sample(&mut pcm, -2, 16, 16);
        assert_eq!(pcm, (-2i16).to_le_bytes());

        // 16 bits source vers 24 bits : décalage gauche de 8.
        pcm.clear();
        write_sample(&mut pcm, 1, 16, 24);
        assert_eq!(pcm, &[0x00, 0x01, 0x00]);

        // 24 bits source vers 16 bits : décalage droite de 8.
        pcm.clear();
        write_sample(&mut pcm, 0x123456, 24, 16);
        assert_eq!(pcm, 0x1234i16.to_le_bytes());

        // 16 bits source vers 32 bits.
        pcm.clear();
        write_sample(&mut pcm, -1, 16, 32);
        assert_eq!(pcm, (-65536i32).to_le_bytes());
    }
}
