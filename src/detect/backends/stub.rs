use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::stream::Frame;

/// Most objects the stub will report for one frame.
const MAX_STUB_DETECTIONS: u8 = 5;

/// Stub backend for testing. Derives detections from a hash of the pixels, so
/// identical frames always produce identical readings.
pub struct StubBackend;

impl StubBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let count = digest[0] % (MAX_STUB_DETECTIONS + 1);
        let detections = (0..count as usize)
            .map(|i| {
                let seed = &digest[1 + i * 4..1 + i * 4 + 4];
                Detection {
                    // 0.25..=0.99 in 0.01 steps
                    confidence: 0.25 + f64::from(seed[0] % 75) / 100.0,
                    class: if seed[1] % 4 == 0 {
                        ObjectClass::OverflowingBin
                    } else {
                        ObjectClass::Garbage
                    },
                    bbox: BoundingBox {
                        x: f32::from(seed[2]) / 510.0,
                        y: f32::from(seed[3]) / 510.0,
                        w: 0.25,
                        h: 0.25,
                    },
                }
            })
            .collect();
        Ok(detections)
    }
}
