/// Join a parent path and a child name.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of a path, or `None` for top-level and root paths.
pub fn parent_of(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

/// Last segment of a path.
pub fn name_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/a", "b"), "/a/b");
        assert_eq!(child_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_of("/a"), None);
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn test_name_of() {
        assert_eq!(name_of("/a/b/c"), "c");
        assert_eq!(name_of("/a"), "a");
    }
}
