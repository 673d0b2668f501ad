use std::path::{Component, Path};

use crate::TransferError;

/// Checks a filename offered by a sending peer before it is joined onto the
/// local download directory.
///
/// The name must be relative and may not climb out of the directory
/// (`..`), carry a root or drive prefix, or be empty.
pub fn validate_offer_name(name: &str) -> Result<(), TransferError> {
    if name.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.contains('\0') {
        return Err(TransferError::InvalidPath(format!("NUL in file name: {name:?}")));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute file name not allowed: {name}"
        )));
    }

    let mut normal = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent traversal not allowed: {name}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "rooted file name not allowed: {name}"
                )));
            }
        }
    }
    if normal == 0 {
        return Err(TransferError::InvalidPath(format!("no file name in {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_and_nested_names() {
        assert!(validate_offer_name("photo.jpg").is_ok());
        assert!(validate_offer_name("album/photo.jpg").is_ok());
        assert!(validate_offer_name("./notes.txt").is_ok());
        assert!(validate_offer_name(".hidden").is_ok());
    }

    #[test]
    fn rejects_empty_and_dot_only() {
        assert!(validate_offer_name("").is_err());
        assert!(validate_offer_name("   ").is_err());
        assert!(validate_offer_name(".").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_offer_name("..").is_err());
        assert!(validate_offer_name("../secret").is_err());
        assert!(validate_offer_name("a/../../b").is_err());
    }

    #[test]
    fn rejects_absolute() {
        assert!(validate_offer_name("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_nul() {
        assert!(validate_offer_name("a\0b").is_err());
    }
}
