pub const PROTOCOL_CACHE_STATUS_KEY: &str = "X-Cache";
pub const PROTOCOL_REQUEST_ID_KEY: &str = "X-Request-ID";

pub const DEFAULT_VIDEO_MIME: &str = "video/mp4";

pub const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".mov", ".avi", ".mkv", ".webm", ".m4v"];

// Prefetch expansion tiers for small range requests.
pub const MIN_CHUNK: u64 = 5 * 1024 * 1024;
pub const OPTIMAL_CHUNK: u64 = 10 * 1024 * 1024;
pub const EXPAND_LIMIT: u64 = 20 * 1024 * 1024;

pub fn is_video_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
