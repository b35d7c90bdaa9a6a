use std::time::Duration;

/// One piece travels per frame; with JSON + base64 overhead it must stay
/// under FRAME_SIZE_LIMIT.
pub const PIECE_SIZE: usize = 15 * 1024;
pub const FRAME_SIZE_LIMIT: usize = 16 * 1024;
pub const PIPELINE_BUDGET: usize = 5;
pub const PEER_CAP: usize = 50;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(10);
pub const ICE_RESTART_GRACE: Duration = Duration::from_secs(5);
pub const TRACKER_STALE_AFTER: Duration = Duration::from_secs(180);
pub const TRACKER_SWEEP_PERIOD: Duration = Duration::from_secs(60);
pub const TRACKER_RECONNECT_DELAY: Duration = Duration::from_secs(3);
