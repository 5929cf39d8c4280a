//! Email address parsing and validation.

use std::sync::LazyLock;

use regex::Regex;

use super::error::{DigestError, DigestResult};

/// Basic syntactic check; deliverability is the mail server's problem.
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern is valid"));

/// Split a list of addresses separated by commas and/or whitespace.
///
/// Entries are trimmed and lowercased; empty entries are dropped.
pub fn email_list_from_csv(csv: &str) -> Vec<String> {
    csv.split(|c: char| c == ',' || c.is_whitespace())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Returns `true` if the address looks like an email address.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// Normalize a batch of addresses, failing on the first batch that contains any invalid entry.
pub fn normalize_emails<I, S>(emails: I) -> DigestResult<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let normalized: Vec<String> = emails.into_iter().map(|e| e.as_ref().trim().to_lowercase()).filter(|e| !e.is_empty()).collect();

    let invalid: Vec<&str> = normalized.iter().filter(|e| !is_valid_email(e)).map(String::as_str).collect();

    if !invalid.is_empty() {
        let list = invalid.iter().map(|e| format!("\"{e}\"")).collect::<Vec<_>>().join(", ");
        return Err(DigestError::validation(format!("Invalid email address(es): {list}.")));
    }

    if normalized.is_empty() {
        return Err(DigestError::validation("No email addresses given."));
    }

    Ok(normalized)
}

// Tests.
