//! HLS master playlist generation.

use std::fmt::Write;

use crate::domain::Resolution;

/// One variant stream in the master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub label: String,
    pub resolution: Resolution,
    pub bitrate_kbps: u32,
    /// Variant playlist path relative to the master playlist.
    pub playlist: String,
}

/// Render the master playlist for `entries`, in the given order.
///
/// The output depends only on the input.
pub fn build_master_playlist(entries: &[ManifestEntry]) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for entry in entries {
        // Writing to a String cannot fail.
        let _ = writeln!(
            playlist,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}",
            entry.bitrate_kbps as u64 * 1000,
            entry.resolution
        );
        playlist.push_str(&entry.playlist);
        playlist.push('\n');
    }
    playlist
}
