use crate::error::{Error, Result};

/// Validate that an identifier is safe for use in key paths.
///
/// Identifiers (namespaces, regions, pool ids) are interpolated into key
/// paths. Without validation, a name like `../../leases/x` could write to
/// arbitrary keys.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} must be 1-128 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} contains invalid characters (only alphanumeric, dash, underscore, dot allowed)"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidState(format!(
            "identifier {name:?} must not start with a dot"
        )));
    }
    Ok(())
}
