//! Query validation and progress arithmetic

use crate::error::{Error, Result};

pub const MIN_QUERY_CHARS: usize = 3;
pub const MAX_QUERY_CHARS: usize = 500;

/// Validate a search query, returning it trimmed.
pub fn validate_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    let len = trimmed.chars().count();

    if len == 0 {
        return Err(Error::Validation("Query cannot be empty".to_string()));
    }
    if len < MIN_QUERY_CHARS {
        return Err(Error::Validation(format!(
            "Query must be at least {} characters long",
            MIN_QUERY_CHARS
        )));
    }
    if len > MAX_QUERY_CHARS {
        return Err(Error::Validation(format!(
            "Query must be less than {} characters",
            MAX_QUERY_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

/// Progress percentage from iteration counts, clamped to 0..=100.
///
/// With no known total, `base` is returned unchanged.
pub fn calculate_progress(current: u32, total: u32, base: f64) -> f64 {
    if total == 0 {
        return base;
    }
    let iteration = f64::from(current) / f64::from(total) * 100.0;
    (base + iteration).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_query() {
        assert_eq!(validate_query("  rust  ").unwrap(), "rust");
        assert!(matches!(validate_query("   "), Err(Error::Validation(_))));
        assert!(matches!(validate_query("ab"), Err(Error::Validation(_))));
        assert!(validate_query(&"x".repeat(500)).is_ok());
        assert!(validate_query(&"x".repeat(501)).is_err());
    }

    #[test]
    fn test_calculate_progress() {
        assert_eq!(calculate_progress(0, 0, 12.0), 12.0);
        assert_eq!(calculate_progress(1, 4, 0.0), 25.0);
        assert_eq!(calculate_progress(5, 5, 30.0), 100.0);
        assert_eq!(calculate_progress(1, 2, -80.0), 0.0);
    }
}
