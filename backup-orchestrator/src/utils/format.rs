//! Human-readable formatting for CLI output and log lines.

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a duration in milliseconds as a short human-readable string
pub fn format_duration_ms(millis: u64) -> String {
    let seconds = millis / 1000;
    if seconds == 0 {
        format!("{}ms", millis)
    } else if seconds < 60 {
        format!("{}.{}s", seconds, (millis % 1000) / 100)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Shorten a checksum for table display (`sha256:abcdef123456…`)
pub fn short_checksum(checksum: &str) -> String {
    match checksum.split_once(':') {
        Some((algo, hex)) if hex.len() > 12 => format!("{}:{}…", algo, &hex[..12]),
        _ => checksum.to_string(),
    }
}
