//! External tool wrappers: probing, encoding, thumbnails and manifests.

pub mod encoder;
pub mod ffmpeg_progress;
pub mod manifest;
pub mod probe;
pub mod thumbnail;
pub mod toolkit;
pub mod traits;
pub mod utils;

pub use encoder::{EncoderSettings, RenditionEncoder, compute_bitrate_kbps};
pub use manifest::{ManifestEntry, build_master_playlist};
pub use probe::{MetadataProber, parse_probe_output};
pub use thumbnail::{ThumbnailExtractor, thumbnail_position};
pub use toolkit::FfmpegToolkit;
pub use traits::{
    MediaToolkit, ProgressFn, RenditionOutput, RenditionRequest, ThumbnailRequest, ToolContext,
    VideoMetadata,
};
pub use utils::{ToolError, ToolOutput, run_tool_capture, run_tool_streaming};
