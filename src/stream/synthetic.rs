//! Synthetic `stub://` frame source.
//!
//! Locator form: `stub://<name>?frames=N&scene_every=K&width=W&height=H`
//!
//! Pixels depend only on the current scene, so a static scene yields identical
//! frames (and identical detector readings). The scene advances every
//! `scene_every` frames; `scene_every=0` keeps it static. Without `frames`
//! the source never runs out.

use anyhow::{anyhow, Result};
use url::Url;

use super::{Frame, FrameSource};

const DEFAULT_WIDTH: u32 = 32;
const DEFAULT_HEIGHT: u32 = 24;
const DEFAULT_SCENE_EVERY: u64 = 150;
const MAX_DIMENSION: u32 = 4096;

#[derive(Debug)]
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    scene_every: u64,
    frame_count: u64,
    scene_state: u8,
    opened: bool,
}

impl SyntheticSource {
    pub fn parse(locator: &str) -> Result<Self> {
        let url = Url::parse(locator).map_err(|e| anyhow!("invalid stub locator: {}", e))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("synthetic source requires stub:// (got {})", url.scheme()));
        }
        let mut source = Self {
            name: url
                .host_str()
                .filter(|h| !h.is_empty())
                .unwrap_or("synthetic")
                .to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frame_limit: None,
            scene_every: DEFAULT_SCENE_EVERY,
            frame_count: 0,
            scene_state: 0,
            opened: false,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => source.frame_limit = Some(parse_param(&key, &value)?),
                "scene_every" => source.scene_every = parse_param(&key, &value)?,
                "width" => source.width = parse_dimension(&key, &value)?,
                "height" => source.height = parse_dimension(&key, &value)?,
                other => log::debug!("stub source {}: ignoring parameter {}", source.name, other),
            }
        }
        Ok(source)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        (0..pixel_count)
            .map(|i| ((i as u64 + u64::from(self.scene_state) * 31) % 256) as u8)
            .collect()
    }
}

fn parse_param(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| anyhow!("stub parameter {} must be a non-negative integer", key))
}

fn parse_dimension(key: &str, value: &str) -> Result<u32> {
    let parsed = parse_param(key, value)?;
    if parsed == 0 || parsed > u64::from(MAX_DIMENSION) {
        return Err(anyhow!(
            "stub parameter {} must be between 1 and {}",
            key,
            MAX_DIMENSION
        ));
    }
    Ok(parsed as u32)
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!(
            "SyntheticSource: opened {} ({}x{}, synthetic)",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            return Err(anyhow!("synthetic source {} read before open", self.name));
        }
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        self.frame_count += 1;
        if self.scene_every > 0 && self.frame_count % self.scene_every == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        Ok(Some(Frame::new(
            self.generate_pixels(),
            self.width,
            self.height,
            self.frame_count,
        )))
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_locator_parameters() {
        let source =
            SyntheticSource::parse("stub://front_bin?frames=5&scene_every=2&width=8&height=4")
                .unwrap();
        assert_eq!(source.describe(), "stub://front_bin");
        assert_eq!(source.frame_limit, Some(5));
        assert_eq!(source.scene_every, 2);
        assert_eq!((source.width, source.height), (8, 4));
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SyntheticSource::parse("stub://bin?frames=-1").is_err());
        assert!(SyntheticSource::parse("stub://bin?width=0").is_err());
        assert!(SyntheticSource::parse("rtsp://bin").is_err());
    }

    #[test]
    fn frame_limit_exhausts_source() {
        let mut source = SyntheticSource::parse("stub://bin?frames=3").unwrap();
        assert!(source.next_frame().is_err());
        source.open().unwrap();
        let sequences: Vec<u64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(source.frames_emitted(), 3);
    }

    #[test]
    fn static_scene_repeats_pixels_until_scene_changes() {
        let mut source = SyntheticSource::parse("stub://bin?scene_every=3&width=2&height=2").unwrap();
        source.open().unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        let third = source.next_frame().unwrap().unwrap();
        assert_eq!(first.pixels(), second.pixels());
        assert_ne!(second.pixels(), third.pixels());
        assert_eq!(first.pixels().len(), 12);
    }
}
