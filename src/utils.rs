//! Utility functions shared across modules

/// Format a number with underscore separators for readability (e.g., 89210 -> "89_210")
pub fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push('_');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Format bytes for human readability (e.g., 1048576 -> "1.00 MB")
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.2} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.2} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Normalize a share-relative path to the canonical index form.
///
/// Index keys are absolute from the share root, use forward slashes, never end
/// with a slash (except the root itself) and contain no empty or `.` segments.
///
/// ```
/// use share_search::utils::normalize_share_path;
///
/// assert_eq!(normalize_share_path("docs\\b.pdf"), "/docs/b.pdf");
/// assert_eq!(normalize_share_path("/docs//./b.pdf/"), "/docs/b.pdf");
/// assert_eq!(normalize_share_path(""), "/");
/// ```
pub fn normalize_share_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Join a child name onto a normalized parent path.
pub fn join_share_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Number of segments between the share root and `path` ("/" is depth 0).
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// True when `path` equals `prefix` or lives underneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Lowercased extension of a file name, without the dot.
///
/// Dotfiles such as `.bashrc` have no extension.
pub fn extension_of(name: &str) -> Option<String> {
    let dot = name.rfind('.')?;
    if dot == 0 || dot + 1 == name.len() {
        return None;
    }
    Some(name[dot + 1..].to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_share_path() {
        assert_eq!(normalize_share_path("/"), "/");
        assert_eq!(normalize_share_path("a/b"), "/a/b");
        assert_eq!(normalize_share_path("\\a\\b\\"), "/a/b");
    }

    #[test]
    fn test_join_and_depth() {
        assert_eq!(join_share_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_share_path("/docs", "b.pdf"), "/docs/b.pdf");
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/docs/b.pdf"), 2);
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/docs/b.pdf", "/docs"));
        assert!(is_under("/docs", "/docs"));
        assert!(!is_under("/docs2/b.pdf", "/docs"));
        assert!(is_under("/anything", "/"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("report.PDF").as_deref(), Some("pdf"));
        assert_eq!(extension_of("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of("trailing."), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1000), "1_000");
        assert_eq!(format_number(1234567), "1_234_567");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 bytes");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }
}
