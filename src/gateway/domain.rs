use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("sender domain is not authorized for this account")]
    Unauthorized,

    #[error("malformed sender address")]
    Malformed,
}

/// Checks an envelope sender against a tenant's allowed domain set.
/// Returns the bare address for use as the outbound envelope sender.
pub fn authorize(envelope_from: &str, allowed: &[String]) -> Result<String, DomainError> {
    let (address, domain) = split_address(envelope_from)?;
    if allowed.iter().any(|d| d.eq_ignore_ascii_case(&domain)) {
        Ok(address)
    } else {
        Err(DomainError::Unauthorized)
    }
}

/// Accepts a bare address or the display form `Name <local@domain>` and
/// returns `(bare_address, domain)`. Exactly one `@` is required; anything
/// else is malformed rather than unauthorized.
pub fn split_address(raw: &str) -> Result<(String, String), DomainError> {
    let raw = raw.trim();

    let address = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => raw[start + 1..end].trim(),
        (None, None) => raw,
        _ => {
            return Err(DomainError::Malformed);
        }
    };

    let parts: Vec<&str> = address.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(DomainError::Malformed);
    }

    Ok((address.to_string(), parts[1].to_ascii_lowercase()))
}
