//! 🔑 Workspace token format check. Offline only, `Endpoint::check_token_remote` asks
//! the dataway whether the token actually exists.

use crate::error::{DatawayError, Result};

/// prefix and the number of alphanumeric chars that must follow it
const TOKEN_FORMATS: &[(&str, usize)] = &[("tkn_", 32), ("tokn_", 24), ("token_", 32)];

/// ✅ `Ok` when `token` looks like something the dataway would issue.
pub fn check_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(DatawayError::EmptyToken);
    }
    for (prefix, len) in TOKEN_FORMATS {
        if let Some(rest) = token.strip_prefix(prefix) {
            if rest.len() == *len && rest.bytes().all(|b| b.is_ascii_alphanumeric()) {
                return Ok(());
            }
            return Err(DatawayError::InvalidToken);
        }
    }
    Err(DatawayError::InvalidToken)
}
