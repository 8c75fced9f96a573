use crate::constants::MAX_OBJECT_PATH_LEN;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("object path must be absolute")]
    NotAbsolute,
    #[error("object path is empty or too long")]
    Length,
    #[error("object path contains a forbidden component")]
    Forbidden,
}

/// Normalize an object path: require a leading slash, strip a trailing one
/// (`/foo` and `/foo/` are the same namespace), and reject traversal tricks.
pub fn normalize_object_path(raw: &str) -> Result<String, PathError> {
    if raw.is_empty() || raw.len() > MAX_OBJECT_PATH_LEN {
        return Err(PathError::Length);
    }
    if !raw.starts_with('/') {
        return Err(PathError::NotAbsolute);
    }
    if raw.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(PathError::Forbidden);
    }
    if raw.split('/').any(|c| c == "." || c == "..") {
        return Err(PathError::Forbidden);
    }

    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Split a normalized path into components. The leading component is always
/// the empty string denoting the root, matching how mount prefixes are
/// configured.
pub fn path_components(path: &str) -> Vec<&str> {
    if path == "/" {
        return vec![""];
    }
    path.split('/').collect()
}
