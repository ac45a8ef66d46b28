//! Synthetic stream for `stub://` URLs.
//!
//! Decodes instantly, so the presentation clock is entirely under the
//! caller's control: `stub://clip?frames=100&fps=10&width=64&height=48`.

use anyhow::{anyhow, Context, Result};
use url::Url;

use super::Frame;

const DEFAULT_FRAMES: u64 = 100;
const DEFAULT_FPS: f64 = 10.0;
const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 48;

pub(super) struct SyntheticStream {
    frames: u64,
    fps: f64,
    width: u32,
    height: u32,
    grabbed: u64,
    scene_state: u8,
    closed: bool,
}

impl SyntheticStream {
    pub(super) fn open(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("invalid stub url '{}'", url))?;

        let mut frames = DEFAULT_FRAMES;
        let mut fps = DEFAULT_FPS;
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        for (key, value) in parsed.query_pairs() {
            match key.as_ref() {
                "frames" => frames = value.parse().context("stub url: frames")?,
                "fps" => fps = value.parse().context("stub url: fps")?,
                "width" => width = value.parse().context("stub url: width")?,
                "height" => height = value.parse().context("stub url: height")?,
                other => return Err(anyhow!("stub url: unknown parameter '{}'", other)),
            }
        }
        if fps <= 0.0 {
            return Err(anyhow!("stub url: fps must be positive"));
        }

        Ok(Self {
            frames,
            fps,
            width,
            height,
            grabbed: 0,
            scene_state: 0,
            closed: false,
        })
    }

    pub(super) fn grab(&mut self) -> bool {
        if self.closed || self.grabbed >= self.frames {
            return false;
        }
        self.grabbed += 1;
        if self.grabbed % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        true
    }

    pub(super) fn position_secs(&self) -> f64 {
        self.grabbed as f64 / self.fps
    }

    pub(super) fn decode(&mut self) -> Option<Frame> {
        if self.closed || self.grabbed == 0 {
            return None;
        }
        Some(Frame {
            pixels: self.generate_pixels(),
            width: self.width,
            height: self.height,
        })
    }

    pub(super) fn close(&mut self) {
        self.closed = true;
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.grabbed + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_clock_follows_fps() {
        let mut stream = SyntheticStream::open("stub://clip?frames=3&fps=4").expect("open");
        assert!(stream.grab());
        assert_eq!(stream.position_secs(), 0.25);
        assert!(stream.grab());
        assert!(stream.grab());
        assert_eq!(stream.position_secs(), 0.75);
        assert!(!stream.grab());
        assert_eq!(stream.position_secs(), 0.75);
    }

    #[test]
    fn decode_is_deterministic_per_position() {
        let mut a = SyntheticStream::open("stub://clip?frames=5&fps=5").expect("open");
        let mut b = SyntheticStream::open("stub://clip?frames=5&fps=5").expect("open");
        a.grab();
        b.grab();
        assert_eq!(a.decode().expect("frame").pixels, b.decode().expect("frame").pixels);
    }

    #[test]
    fn closed_stream_stops_yielding() {
        let mut stream = SyntheticStream::open("stub://clip?frames=5&fps=5").expect("open");
        assert!(stream.grab());
        stream.close();
        assert!(!stream.grab());
        assert!(stream.decode().is_none());
    }

    #[test]
    fn rejects_unknown_parameters() {
        assert!(SyntheticStream::open("stub://clip?loop=1").is_err());
    }
}
