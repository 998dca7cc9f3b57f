//! Parser for ffmpeg's machine-readable `-progress pipe:1` output.
//!
//! ffmpeg writes blocks of `key=value` lines, each block terminated by
//! `progress=continue` or `progress=end`:
//!
//! ```text
//! frame=120
//! out_time_us=4004000
//! out_time=00:00:04.004000
//! speed=2.01x
//! progress=continue
//! ```

/// Parse time string in `HH:MM:SS.micros` format to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Turns progress lines into percent-complete values for a known duration.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: f64,
    out_time_secs: Option<f64>,
    last_percent: f64,
}

impl ProgressParser {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            out_time_secs: None,
            last_percent: 0.0,
        }
    }

    /// Feed one line. Returns the percent complete at the end of each block.
    ///
    /// Reported values never decrease and stay within 0-100. Without a known
    /// duration only the final `progress=end` yields a value.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            // Both are microseconds; `out_time_ms` is misnamed by ffmpeg.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>()
                    && us >= 0
                {
                    self.out_time_secs = Some(us as f64 / 1_000_000.0);
                }
                None
            }
            "out_time" => {
                if self.out_time_secs.is_none()
                    && let Some(secs) = parse_time(value)
                {
                    self.out_time_secs = Some(secs);
                }
                None
            }
            "progress" => {
                let percent = if value == "end" {
                    Some(100.0)
                } else if self.duration_secs > 0.0 {
                    self.out_time_secs
                        .map(|secs| (secs / self.duration_secs * 100.0).clamp(0.0, 100.0))
                } else {
                    None
                };
                self.out_time_secs = None;
                let percent = percent?.max(self.last_percent);
                self.last_percent = percent;
                Some(percent)
            }
            _ => None,
        }
    }
}
