//! Errors raised synchronously by the [`IndexRegistry`](crate::registry::IndexRegistry) façade.
//!
//! Build and refresh failures are not reported through this type; they are
//! recorded on the share's index metadata and surfaced by status queries.

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("invalid share id: {0:?}")]
    InvalidShareId(String),

    #[error("share not found: {0}")]
    ShareNotFound(String),

    #[error("share is disabled: {0}")]
    ShareDisabled(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Share ids double as on-disk file stems, so they are restricted to a
/// conservative character set.
pub fn validate_share_id(share_id: &str) -> Result<()> {
    let valid = !share_id.is_empty()
        && share_id.len() <= 128
        && share_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidShareId(share_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_share_id() {
        assert!(validate_share_id("media").is_ok());
        assert!(validate_share_id("nas-01_backup").is_ok());
        assert!(validate_share_id("").is_err());
        assert!(validate_share_id("../etc").is_err());
        assert!(validate_share_id("a/b").is_err());
        assert!(validate_share_id(&"x".repeat(129)).is_err());
    }
}
