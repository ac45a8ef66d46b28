//! Frame sources.
//!
//! A `VideoStream` opens a decode target by URL and yields frames with a
//! stream-relative presentation offset. Grabbing advances the decode position
//! without materializing pixels, so the pipeline can discard catch-up frames
//! cheaply; `decode` materializes pixel data only for frames that are kept.
//!
//! Backends:
//! - `stub://` URLs get a synthetic stream with a caller-controlled
//!   presentation clock (`stub://clip?frames=100&fps=10`), used by tests and
//!   the default configuration
//! - anything else decodes through FFmpeg (feature: decode-ffmpeg)

mod synthetic;

#[cfg(feature = "decode-ffmpeg")]
mod ffmpeg;

use anyhow::Result;

use synthetic::SyntheticStream;

#[cfg(feature = "decode-ffmpeg")]
use ffmpeg::FfmpegStream;

/// Decoded pixel data for one frame (RGB24, row-major).
#[derive(Clone, Debug)]
pub struct Frame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A decodable video stream. One instance is owned by one pipeline run.
pub struct VideoStream {
    backend: StreamBackend,
}

enum StreamBackend {
    Synthetic(SyntheticStream),
    #[cfg(feature = "decode-ffmpeg")]
    Ffmpeg(FfmpegStream),
}

impl VideoStream {
    pub fn open(url: &str) -> Result<Self> {
        if url.starts_with("stub://") {
            Ok(Self {
                backend: StreamBackend::Synthetic(SyntheticStream::open(url)?),
            })
        } else {
            #[cfg(feature = "decode-ffmpeg")]
            {
                Ok(Self {
                    backend: StreamBackend::Ffmpeg(FfmpegStream::open(url)?),
                })
            }
            #[cfg(not(feature = "decode-ffmpeg"))]
            {
                anyhow::bail!("decoding '{}' requires the decode-ffmpeg feature", url)
            }
        }
    }

    /// Advance the decode position. Returns false at end-of-stream or on a
    /// fatal decode error, which terminates the run.
    pub fn grab(&mut self) -> bool {
        match &mut self.backend {
            StreamBackend::Synthetic(stream) => stream.grab(),
            #[cfg(feature = "decode-ffmpeg")]
            StreamBackend::Ffmpeg(stream) => stream.grab(),
        }
    }

    /// Stream-relative presentation offset of the last grabbed position,
    /// in seconds.
    pub fn position_secs(&self) -> f64 {
        match &self.backend {
            StreamBackend::Synthetic(stream) => stream.position_secs(),
            #[cfg(feature = "decode-ffmpeg")]
            StreamBackend::Ffmpeg(stream) => stream.position_secs(),
        }
    }

    /// Materialize pixel data for the last grabbed position.
    pub fn decode(&mut self) -> Option<Frame> {
        match &mut self.backend {
            StreamBackend::Synthetic(stream) => stream.decode(),
            #[cfg(feature = "decode-ffmpeg")]
            StreamBackend::Ffmpeg(stream) => stream.decode(),
        }
    }

    /// Release decode resources. Idempotent; called on every exit path.
    pub fn close(&mut self) {
        match &mut self.backend {
            StreamBackend::Synthetic(stream) => stream.close(),
            #[cfg(feature = "decode-ffmpeg")]
            StreamBackend::Ffmpeg(stream) => stream.close(),
        }
    }
}
