use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

// Marker color for an entity's liveness
pub fn marker_color(online: bool) -> &'static str {
    if online {
        "green"
    } else {
        "red"
    }
}

// Fixed-length file-name-safe key for an id of any length
pub fn record_key(id: &str) -> String {
    Sha256::digest(id.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
