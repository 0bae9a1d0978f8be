//! Build metadata stamped by build.rs, surfaced in the startup banner.

pub fn build_host() -> &'static str {
    option_env!("DEPUTY_BUILD_HOST").unwrap_or("unknown")
}

/// Build timestamp as seconds since the epoch; 0 when the build script did
/// not run (e.g. docs builds).
pub fn build_epoch() -> i64 {
    option_env!("DEPUTY_BUILD_EPOCH")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn format_epoch(secs: i64) -> String {
    if secs <= 0 {
        return "unknown time".to_string();
    }
    match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "unknown time".to_string(),
    }
}

pub fn banner() -> String {
    format!(
        "procman deputy (built on {} at {}).",
        build_host(),
        format_epoch(build_epoch())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_renders_as_utc() {
        assert_eq!(format_epoch(1_700_000_000), "2023-11-14 22:13:20 UTC");
        assert_eq!(format_epoch(0), "unknown time");
        assert_eq!(format_epoch(-5), "unknown time");
    }

    #[test]
    fn banner_names_the_deputy() {
        assert!(banner().starts_with("procman deputy (built on "));
    }
}
