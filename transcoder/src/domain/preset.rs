//! Rendition quality presets.

use serde::{Deserialize, Serialize};

/// x264 speed/quality tradeoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPreset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl SpeedPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ultrafast => "ultrafast",
            Self::Superfast => "superfast",
            Self::Veryfast => "veryfast",
            Self::Faster => "faster",
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
            Self::Slower => "slower",
            Self::Veryslow => "veryslow",
        }
    }
}

/// One output rendition of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPreset {
    /// Output height in pixels. Width follows the source aspect ratio.
    pub height: u32,
    /// Fixed video bitrate. Derived from the output frame size when absent.
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Constant Rate Factor (0-51, lower is better).
    pub crf: u8,
    #[serde(default)]
    pub speed: SpeedPreset,
}

impl QualityPreset {
    pub fn new(height: u32, crf: u8, speed: SpeedPreset) -> Self {
        Self {
            height,
            bitrate_kbps: None,
            crf,
            speed,
        }
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    /// Resolution label, e.g. `720p`.
    pub fn label(&self) -> String {
        format!("{}p", self.height)
    }

    /// The default 1080p/720p/480p ladder.
    pub fn default_ladder() -> Vec<QualityPreset> {
        vec![
            QualityPreset::new(1080, 18, SpeedPreset::Slower),
            QualityPreset::new(720, 20, SpeedPreset::Medium),
            QualityPreset::new(480, 23, SpeedPreset::Veryfast),
        ]
    }

    /// Presets worth encoding for a source `source_height` pixels tall.
    ///
    /// Presets taller than the source are dropped; if every preset is taller,
    /// the smallest one is kept so at least one rendition is produced.
    pub fn applicable(presets: &[QualityPreset], source_height: u32) -> Vec<QualityPreset> {
        let fitting: Vec<QualityPreset> = presets
            .iter()
            .filter(|p| p.height <= source_height)
            .cloned()
            .collect();
        if !fitting.is_empty() {
            return fitting;
        }
        presets
            .iter()
            .min_by_key(|p| p.height)
            .cloned()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heights(presets: &[QualityPreset]) -> Vec<u32> {
        presets.iter().map(|p| p.height).collect()
    }

    #[test]
    fn test_default_ladder() {
        let ladder = QualityPreset::default_ladder();
        assert_eq!(heights(&ladder), vec![1080, 720, 480]);
        assert_eq!(ladder[0].speed.as_str(), "slower");
        assert_eq!(ladder[2].label(), "480p");
    }

    #[test]
    fn test_applicable_skips_upscaling() {
        let ladder = QualityPreset::default_ladder();
        assert_eq!(heights(&QualityPreset::applicable(&ladder, 2160)), vec![1080, 720, 480]);
        assert_eq!(heights(&QualityPreset::applicable(&ladder, 720)), vec![720, 480]);
        assert_eq!(heights(&QualityPreset::applicable(&ladder, 240)), vec![480]);
        assert!(QualityPreset::applicable(&[], 1080).is_empty());
    }

    #[test]
    fn test_deserialize_preset() {
        let preset: QualityPreset =
            serde_json::from_str(r#"{"height": 360, "crf": 26, "speed": "veryfast"}"#).unwrap();
        assert_eq!(preset.speed, SpeedPreset::Veryfast);
        assert!(preset.bitrate_kbps.is_none());
    }
}
