//! Configuration value parsing and validation helpers

use std::time::Duration;

use super::Config;

/// Parse a duration string like "30s", "30m", "1h", "2h30m"
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let mut total_seconds: u64 = 0;
    let mut current_num = String::new();

    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", s))?;
            current_num.clear();

            total_seconds += match c {
                's' => num,
                'm' => num * 60,
                'h' => num * 3600,
                'd' => num * 86400,
                _ => return Err(format!("Unknown duration unit: {}", c)),
            };
        }
    }

    if !current_num.is_empty() {
        return Err(format!("Missing unit in duration: {}", s));
    }

    if total_seconds == 0 {
        return Err(format!("Invalid duration: {}", s));
    }

    Ok(Duration::from_secs(total_seconds))
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<(), String> {
    parse_duration(&config.rehearsal.idle_ttl)?;
    parse_duration(&config.rehearsal.sweep_interval)?;
    parse_duration(&config.speech.timeout)?;

    let r = &config.rehearsal;
    if !(r.default_pause_min_sec.is_finite() && r.default_pause_min_sec >= 0.0) {
        return Err(format!(
            "rehearsal.default_pause_min_sec must be >= 0, got {}",
            r.default_pause_min_sec
        ));
    }
    if !(r.default_pause_max_sec.is_finite() && r.default_pause_max_sec >= r.default_pause_min_sec)
    {
        return Err(format!(
            "rehearsal.default_pause_max_sec ({}) must be >= default_pause_min_sec ({})",
            r.default_pause_max_sec, r.default_pause_min_sec
        ));
    }

    match config.speech.provider.as_str() {
        "mock" => {}
        "http" => {
            if config.speech.endpoint.trim().is_empty() {
                return Err("speech.endpoint is required for the http provider".to_string());
            }
        }
        other => return Err(format!("Unknown speech provider: {}", other)),
    }

    Ok(())
}
