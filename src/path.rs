//! Internal absolute-path splitting.
//!
//! This is not a general path library — parsing host-facing paths is an
//! external collaborator's job (see the crate's top-level docs). This
//! module only turns an already-absolute string into the component list
//! `namespace` resolution needs, and rejects the one thing the spec asks
//! the core itself to reject: non-absolute input.

use crate::error::{FsError, Result};

/// Splits an absolute path into its non-empty components.
///
/// `"/"` splits into an empty component list (the root itself). Repeated
/// separators are collapsed; a non-absolute path is rejected.
pub fn split_absolute(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path {path:?} is not absolute"
        )));
    }

    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

/// Splits an absolute path into its parent's components and the final
/// component's name. Fails if the path is the root itself (no parent).
pub fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut components = split_absolute(path)?;
    let name = components
        .pop()
        .ok_or_else(|| FsError::InvalidArgument("root has no parent".into()))?;
    Ok((components, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_components() {
        assert_eq!(split_absolute("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(split_absolute("/").unwrap(), Vec::<&str>::new());
    }

    #[test]
    fn collapses_repeated_separators() {
        assert_eq!(split_absolute("/a//b").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn rejects_relative_paths() {
        assert!(matches!(
            split_absolute("a/b"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn splits_parent_and_name() {
        let (parent, name) = split_parent("/a/b/f").unwrap();
        assert_eq!(parent, vec!["a", "b"]);
        assert_eq!(name, "f");
    }
}
