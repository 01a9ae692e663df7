//! Path normalization for the virtual filesystem, spec §4.6: resolve `..`
//! against the root without ever escaping it, reject anything that isn't a
//! clean absolute path.

use super::VfsError;

/// Maximum path length in bytes, spec §3.
const MAX_PATH_BYTES: usize = 4096;

/// Splits an absolute path into its normalized component list, collapsing
/// `.`/empty segments and resolving `..` against the already-normalized
/// prefix. `..` past the root collapses to the root rather than erroring,
/// per spec §4.6 ("`/..` collapses to `/`"); `InvalidPath` is reserved for
/// paths that aren't absolute, carry control characters, or exceed the
/// length ceiling.
pub fn normalize(path: &str) -> Result<Vec<String>, VfsError> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidPath(path.to_string()));
    }
    if path.len() > MAX_PATH_BYTES || path.chars().any(|c| c.is_control() && c != '\0') {
        return Err(VfsError::InvalidPath(path.to_string()));
    }
    let mut components: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                components.pop();
            }
            seg if seg.contains('\0') => return Err(VfsError::InvalidPath(path.to_string())),
            seg => components.push(seg.to_string()),
        }
    }
    Ok(components)
}

/// Renders a component list back into a canonical absolute path string,
/// e.g. for use in error messages or the module resolver.
pub fn render(components: &[String]) -> String {
    if components.is_empty() {
        return "/".to_string();
    }
    format!("/{}", components.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("/a/./b/../c").unwrap();
        let rendered = render(&once);
        let twice = normalize(&rendered).unwrap();
        assert_eq!(once, twice);
        assert_eq!(rendered, "/a/c");
    }

    #[test]
    fn dotdot_past_root_collapses_to_root_without_escaping() {
        assert_eq!(normalize("/../escape").unwrap(), vec!["escape".to_string()]);
        assert_eq!(normalize("/a/../../escape").unwrap(), vec!["escape".to_string()]);
        assert_eq!(render(&normalize("/..").unwrap()), "/");
    }

    #[test]
    fn relative_path_is_invalid() {
        assert!(normalize("relative/path").is_err());
    }
}
