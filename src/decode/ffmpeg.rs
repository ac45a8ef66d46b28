//! FFmpeg-backed stream decode (feature: decode-ffmpeg).
//!
//! Grabbing drives the demuxer/decoder until one frame is available and
//! records its presentation timestamp; the RGB conversion is deferred to
//! `decode` so skipped frames never pay for scaling or the pixel copy.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::Frame;

pub(super) struct FfmpegStream {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    pending: ffmpeg::frame::Video,
    have_frame: bool,
    position_secs: f64,
    eof_sent: bool,
    closed: bool,
}

impl FfmpegStream {
    pub(super) fn open(url: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&url)
            .with_context(|| format!("failed to open input '{}' with ffmpeg", url))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("input has no video track"))?;
        let stream_index = input_stream.index();
        let time_base = f64::from(input_stream.time_base());
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            time_base,
            decoder,
            scaler,
            pending: ffmpeg::frame::Video::empty(),
            have_frame: false,
            position_secs: 0.0,
            eof_sent: false,
            closed: false,
        })
    }

    pub(super) fn grab(&mut self) -> bool {
        if self.closed {
            return false;
        }
        loop {
            if self.receive_pending() {
                return true;
            }
            if self.eof_sent {
                return false;
            }
            match self.next_video_packet() {
                Some(packet) => {
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        log::warn!("ffmpeg decode failed: {}", e);
                        self.closed = true;
                        return false;
                    }
                }
                None => {
                    // Demuxer exhausted; flush buffered decoder frames.
                    self.eof_sent = true;
                    let _ = self.decoder.send_eof();
                }
            }
        }
    }

    pub(super) fn position_secs(&self) -> f64 {
        self.position_secs
    }

    pub(super) fn decode(&mut self) -> Option<Frame> {
        if self.closed || !self.have_frame {
            return None;
        }
        let mut rgb = ffmpeg::frame::Video::empty();
        if let Err(e) = self.scaler.run(&self.pending, &mut rgb) {
            log::warn!("ffmpeg scale failed: {}", e);
            return None;
        }
        match frame_to_pixels(&rgb) {
            Ok((pixels, width, height)) => Some(Frame {
                pixels,
                width,
                height,
            }),
            Err(e) => {
                log::warn!("ffmpeg frame copy failed: {}", e);
                None
            }
        }
    }

    pub(super) fn close(&mut self) {
        if !self.closed {
            let _ = self.decoder.send_eof();
            self.closed = true;
        }
    }

    fn receive_pending(&mut self) -> bool {
        if self.decoder.receive_frame(&mut self.pending).is_ok() {
            let ts = self.pending.timestamp().unwrap_or(0);
            self.position_secs = ts as f64 * self.time_base;
            self.have_frame = true;
            true
        } else {
            false
        }
    }

    fn next_video_packet(&mut self) -> Option<ffmpeg::codec::packet::Packet> {
        let stream_index = self.stream_index;
        let mut packets = self.input.packets();
        loop {
            match packets.next() {
                Some((stream, packet)) if stream.index() == stream_index => return Some(packet),
                Some(_) => continue,
                None => return None,
            }
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
