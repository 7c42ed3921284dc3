//! Transcoding between wire frames and linear PCM.
//!
//! A [`CodecContext`] is created once per session and dropped with it. It
//! holds a decoder for inbound audio and an encoder for playback; predictive
//! codecs keep per-stream state in each half, so the halves are never shared
//! between sessions. [`CodecContext::into_parts`] lets the playback task own
//! the encoder while the audio tick owns the decoder.

use bytes::Bytes;
use parley_types::{EncodedFrame, PcmFrame, SAMPLES_PER_FRAME};
use serde::{Deserialize, Serialize};

/// Wire codecs understood by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Raw little-endian signed 16-bit PCM, one frame per packet.
    #[default]
    Pcm16,
    /// Opus at 48 kHz stereo. Requires the `opus` feature.
    Opus,
}

/// Errors raised by codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be decoded into exactly one PCM frame.
    #[error("malformed audio in frame {sequence}: {reason}")]
    MalformedAudio { sequence: u16, reason: String },

    /// The PCM handed to the encoder was not one full frame, or the encoder failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The codec could not be created.
    #[error("codec initialisation failed: {0}")]
    Init(String),

    /// The codec is not compiled into this build.
    #[error("codec {0:?} is not available in this build")]
    Unsupported(CodecKind),
}

/// Decoding half of a codec.
pub trait FrameDecoder: Send {
    /// Decodes one wire frame into one PCM frame.
    fn decode(&mut self, frame: &EncodedFrame) -> Result<PcmFrame, CodecError>;

    /// Produces a replacement frame for a packet that never arrived.
    ///
    /// Stateless codecs emit silence; predictive codecs may synthesise a
    /// smoother continuation.
    fn conceal(&mut self, sequence: u16, timestamp: u32) -> PcmFrame {
        PcmFrame::silence(sequence, timestamp)
    }
}

/// Encoding half of a codec.
pub trait FrameEncoder: Send {
    /// Encodes exactly one frame of interleaved PCM into a wire payload.
    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError>;
}

/// Per-session codec state.
pub struct CodecContext {
    kind: CodecKind,
    decoder: Box<dyn FrameDecoder>,
    encoder: Box<dyn FrameEncoder>,
}

impl std::fmt::Debug for CodecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecContext")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl CodecContext {
    /// Creates a fresh decoder/encoder pair for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if the codec was not compiled in,
    /// or [`CodecError::Init`] if the codec library refused the parameters.
    pub fn new(kind: CodecKind) -> Result<Self, CodecError> {
        let (decoder, encoder): (Box<dyn FrameDecoder>, Box<dyn FrameEncoder>) = match kind {
            CodecKind::Pcm16 => (Box::new(Pcm16Codec), Box::new(Pcm16Codec)),
            #[cfg(feature = "opus")]
            CodecKind::Opus => (
                Box::new(opus_codec::OpusFrameDecoder::new()?),
                Box::new(opus_codec::OpusFrameEncoder::new()?),
            ),
            #[cfg(not(feature = "opus"))]
            CodecKind::Opus => return Err(CodecError::Unsupported(kind)),
        };
        Ok(Self {
            kind,
            decoder,
            encoder,
        })
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    pub fn decode(&mut self, frame: &EncodedFrame) -> Result<PcmFrame, CodecError> {
        self.decoder.decode(frame)
    }

    pub fn conceal(&mut self, sequence: u16, timestamp: u32) -> PcmFrame {
        self.decoder.conceal(sequence, timestamp)
    }

    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        self.encoder.encode(samples)
    }

    /// Splits the context so decode and encode can live on different tasks.
    pub fn into_parts(self) -> (Box<dyn FrameDecoder>, Box<dyn FrameEncoder>) {
        (self.decoder, self.encoder)
    }
}

/// Raw PCM "codec": the payload is the frame's samples as little-endian i16.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pcm16Codec;

impl FrameDecoder for Pcm16Codec {
    fn decode(&mut self, frame: &EncodedFrame) -> Result<PcmFrame, CodecError> {
        let payload = frame.payload();
        if payload.len() != SAMPLES_PER_FRAME * 2 {
            return Err(CodecError::MalformedAudio {
                sequence: frame.sequence(),
                reason: format!(
                    "expected {} payload bytes, got {}",
                    SAMPLES_PER_FRAME * 2,
                    payload.len()
                ),
            });
        }
        let samples = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        PcmFrame::new(frame.sequence(), frame.timestamp(), samples).map_err(|e| {
            CodecError::MalformedAudio {
                sequence: frame.sequence(),
                reason: e.to_string(),
            }
        })
    }
}

impl FrameEncoder for Pcm16Codec {
    fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != SAMPLES_PER_FRAME {
            return Err(CodecError::Encode(format!(
                "expected {} samples, got {}",
                SAMPLES_PER_FRAME,
                samples.len()
            )));
        }
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(Bytes::from(payload))
    }
}

#[cfg(feature = "opus")]
mod opus_codec {
    use super::{CodecError, FrameDecoder, FrameEncoder};
    use bytes::Bytes;
    use parley_types::{EncodedFrame, PcmFrame, SAMPLES_PER_CHANNEL, SAMPLES_PER_FRAME, SAMPLE_RATE};

    /// Upper bound on one Opus packet.
    const MAX_PACKET_SIZE: usize = 4000;

    pub(super) struct OpusFrameDecoder {
        decoder: opus::Decoder,
    }

    impl OpusFrameDecoder {
        pub(super) fn new() -> Result<Self, CodecError> {
            let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Stereo)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            Ok(Self { decoder })
        }
    }

    impl FrameDecoder for OpusFrameDecoder {
        fn decode(&mut self, frame: &EncodedFrame) -> Result<PcmFrame, CodecError> {
            let mut output = vec![0i16; SAMPLES_PER_FRAME];
            let decoded = self
                .decoder
                .decode(frame.payload(), &mut output, false)
                .map_err(|e| CodecError::MalformedAudio {
                    sequence: frame.sequence(),
                    reason: e.to_string(),
                })?;
            if decoded != SAMPLES_PER_CHANNEL {
                return Err(CodecError::MalformedAudio {
                    sequence: frame.sequence(),
                    reason: format!("decoded {decoded} samples per channel, expected {SAMPLES_PER_CHANNEL}"),
                });
            }
            PcmFrame::new(frame.sequence(), frame.timestamp(), output).map_err(|e| {
                CodecError::MalformedAudio {
                    sequence: frame.sequence(),
                    reason: e.to_string(),
                }
            })
        }

        fn conceal(&mut self, sequence: u16, timestamp: u32) -> PcmFrame {
            // An empty packet asks libopus for packet-loss concealment.
            let mut output = vec![0i16; SAMPLES_PER_FRAME];
            match self.decoder.decode(&[], &mut output, false) {
                Ok(n) if n == SAMPLES_PER_CHANNEL => PcmFrame::new(sequence, timestamp, output)
                    .map(PcmFrame::into_synthetic)
                    .unwrap_or_else(|_| PcmFrame::silence(sequence, timestamp)),
                _ => PcmFrame::silence(sequence, timestamp),
            }
        }
    }

    pub(super) struct OpusFrameEncoder {
        encoder: opus::Encoder,
    }

    impl OpusFrameEncoder {
        pub(super) fn new() -> Result<Self, CodecError> {
            let mut encoder =
                opus::Encoder::new(SAMPLE_RATE, opus::Channels::Stereo, opus::Application::Voip)
                    .map_err(|e| CodecError::Init(e.to_string()))?;
            encoder
                .set_inband_fec(true)
                .map_err(|e| CodecError::Init(e.to_string()))?;
            Ok(Self { encoder })
        }
    }

    impl FrameEncoder for OpusFrameEncoder {
        fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
            if samples.len() != SAMPLES_PER_FRAME {
                return Err(CodecError::Encode(format!(
                    "expected {} samples, got {}",
                    SAMPLES_PER_FRAME,
                    samples.len()
                )));
            }
            let mut output = vec![0u8; MAX_PACKET_SIZE];
            let len = self
                .encoder
                .encode(samples, &mut output)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            output.truncate(len);
            Ok(Bytes::from(output))
        }
    }
}
