//! Identifier validation
//!
//! Project, tree and task ids are caller-chosen strings. They become part of
//! every record key, so they must be non-empty and printable.

use crate::error::{CtxError, Result};

/// Longest id accepted for any component of a record key.
pub const MAX_ID_LEN: usize = 256;

/// Validate one id component, naming the field in the error.
pub fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CtxError::InvalidInput(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CtxError::InvalidInput(format!(
            "{field} longer than {MAX_ID_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(CtxError::InvalidInput(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}
