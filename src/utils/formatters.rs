use std::time::Duration;

/// Converts bytes to a human-readable size ("0 Bytes", "1.50 KB", ...).
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut order = 0;
    let mut scaled = bytes as f64;
    while scaled >= 1024.0 && order < UNITS.len() - 1 {
        scaled /= 1024.0;
        order += 1;
    }
    format!("{:.2} {}", scaled, UNITS[order])
}

/// Transfer speed, e.g. "1.25 MB/s".
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_file_size(bytes_per_sec.max(0.0) as u64))
}

/// Remaining time: "42s" under a minute, otherwise "3m 7s".
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs_f64().round() as u64;
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Shortens a peer id to its first 12 characters.
pub fn short_peer_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512.00 Bytes");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(1048576), "1.00 MB");
        assert_eq!(format_file_size(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(187)), "3m 7s");
    }

    #[test]
    fn test_short_peer_id() {
        assert_eq!(short_peer_id("abc"), "abc");
        assert_eq!(short_peer_id("abcdefghijklmnop"), "abcdefghijkl");
    }
}
