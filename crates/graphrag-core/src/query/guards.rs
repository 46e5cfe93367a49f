//! Shared guardrails for query payload bounds.

use crate::config::QuerySettings;

pub const MAX_QUERY_LENGTH: usize = 512;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

/// A missing or zero limit falls back to the configured default; anything
/// else is clamped into `1..=max_limit`.
pub fn clamp_limit(requested: Option<usize>, settings: &QuerySettings) -> usize {
    match requested {
        None | Some(0) => settings.default_limit.min(settings.max_limit).max(1),
        Some(value) => clamp_int(value as i64, 1, settings.max_limit.max(1) as i64) as usize,
    }
}

/// Trim whitespace and cut to [`MAX_QUERY_LENGTH`] bytes on a char boundary.
pub fn truncate_query(query: &str) -> String {
    let stripped = query.trim();
    if stripped.len() <= MAX_QUERY_LENGTH {
        return stripped.to_string();
    }
    let mut end = MAX_QUERY_LENGTH;
    while !stripped.is_char_boundary(end) {
        end -= 1;
    }
    stripped[..end].to_string()
}
