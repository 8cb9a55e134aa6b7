/// Axis-aligned box in normalized 0..1 coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// Model confidence in [0, 1].
    pub confidence: f64,
    pub class: ObjectClass,
    pub bbox: BoundingBox,
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectClass {
    Garbage,
    OverflowingBin,
    Unknown,
}

/// Reduce a frame's detections to the `(count, confidences)` reading the
/// recorder consumes.
pub fn summarize(detections: &[Detection]) -> (u32, Vec<f64>) {
    let count = u32::try_from(detections.len()).unwrap_or(u32::MAX);
    let scores = detections.iter().map(|d| d.confidence).collect();
    (count, scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_keeps_detection_order() {
        let bbox = BoundingBox {
            x: 0.1,
            y: 0.1,
            w: 0.2,
            h: 0.2,
        };
        let detections = vec![
            Detection {
                confidence: 0.81,
                class: ObjectClass::Garbage,
                bbox,
            },
            Detection {
                confidence: 0.42,
                class: ObjectClass::OverflowingBin,
                bbox,
            },
        ];
        assert_eq!(summarize(&detections), (2, vec![0.81, 0.42]));
        assert_eq!(summarize(&[]), (0, vec![]));
    }
}
