use std::path::{Component, Path, PathBuf};

/// Resolve a caller supplied directory against `root`.
///
/// Paths already under `root` come back unchanged, so resolving twice is
/// the same as resolving once. Anything else is joined onto `root`; a
/// leading `/` on a path outside the root is treated as root-relative.
pub fn resolve_path(root: &Path, input: impl AsRef<Path>) -> PathBuf {
    let input = input.as_ref();
    if input.starts_with(root) {
        return input.to_path_buf();
    }
    let relative: PathBuf = input
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    root.join(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_under_root_is_unchanged() {
        let root = Path::new("/srv/shares");
        assert_eq!(
            resolve_path(root, "/srv/shares/a"),
            PathBuf::from("/srv/shares/a")
        );
        assert_eq!(resolve_path(root, root), root.to_path_buf());
    }

    #[test]
    fn test_relative_path_joins_root() {
        let root = Path::new("/srv/shares");
        assert_eq!(resolve_path(root, "a/b"), PathBuf::from("/srv/shares/a/b"));
    }

    #[test]
    fn test_absolute_path_outside_root_is_reparented() {
        let root = Path::new("/srv/shares");
        assert_eq!(resolve_path(root, "/a"), PathBuf::from("/srv/shares/a"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let root = Path::new("/srv/shares");
        for input in ["a", "/a", "a/b/c", "/srv/shares/x"] {
            let once = resolve_path(root, input);
            assert_eq!(resolve_path(root, &once), once);
        }
    }

    #[test]
    fn test_sibling_prefix_is_not_under_root() {
        // component-wise comparison, not string prefix
        let root = Path::new("/srv/shares");
        assert_eq!(
            resolve_path(root, "/srv/shares-other"),
            PathBuf::from("/srv/shares/srv/shares-other")
        );
    }
}
