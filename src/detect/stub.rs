use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::decode::Frame;
use crate::detect::backend::Detector;
use crate::detect::HitBox;

/// Stub detector for tests and the default configuration.
///
/// Derives hits deterministically from a pixel hash, so identical frames
/// always produce identical detections. Track ids mimic a tracker: they stay
/// stable while the number of concurrent hits is unchanged and advance when
/// it changes.
pub struct StubDetector {
    last_hash: Option<[u8; 32]>,
    track_base: i64,
    last_count: usize,
}

impl StubDetector {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            track_base: 0,
            last_count: 0,
        }
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame, _t_secs: f64) -> Result<Vec<HitBox>> {
        let hash: [u8; 32] = Sha256::digest(&frame.pixels).into();
        let changed = self.last_hash.map(|prev| prev != hash).unwrap_or(true);
        self.last_hash = Some(hash);

        let count = (hash[0] % 3) as usize;
        if changed && count != self.last_count {
            self.track_base += self.last_count as i64;
            self.last_count = count;
        }

        let hits = (0..count)
            .map(|i| {
                let b = &hash[1 + i * 4..5 + i * 4];
                HitBox {
                    x: b[0] as f64 / 255.0,
                    y: b[1] as f64 / 255.0,
                    w: (1.0 + b[2] as f64) / 512.0,
                    h: (1.0 + b[3] as f64) / 512.0,
                    c: 0.5 + (hash[31] as f64 / 512.0),
                    track_id: Some(self.track_base + i as i64),
                }
            })
            .collect();
        Ok(hits)
    }
}
