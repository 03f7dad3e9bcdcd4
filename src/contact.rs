//! Contact normalization shared by lead ingestion, lead updates and
//! organization records.
//!
//! Phones travel as `+1` followed by exactly ten digits. Emails are trimmed
//! and lower-cased so duplicate matching can compare them byte for byte.

use regex::Regex;
use std::sync::OnceLock;

/// Country calling code for North American numbers.
const COUNTRY_PREFIX: &str = "+1";
/// Digits in a national (area code + subscriber) number.
const NATIONAL_DIGITS: usize = 10;

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| {
        // RFC 5322 simplified: local@domain.tld
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Normalize a phone number to `+1XXXXXXXXXX`.
///
/// Accepts 10 digits, or 11 digits with a leading country code `1`, with any
/// punctuation or spaces in between. Blank input yields `Ok(None)`.
///
/// Returns: `Ok(Some(normalized))`, `Ok(None)` for blank input, or `Err` with
/// a message suitable for the API response.
pub fn normalize_phone(raw: &str) -> Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    if trimmed
        .chars()
        .any(|c| c.is_alphabetic())
    {
        return Err(format!("Invalid phone number '{}': letters are not allowed", raw));
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    let national = match digits.len() {
        NATIONAL_DIGITS => digits.as_str(),
        11 if digits.starts_with('1') => &digits[1..],
        _ => {
            tracing::debug!("❌ Rejected phone '{}' ({} digits)", raw, digits.len());
            return Err(format!(
                "Invalid phone number '{}': expected 10 digits after the +1 prefix",
                raw
            ));
        }
    };

    Ok(Some(format!("{}{}", COUNTRY_PREFIX, national)))
}

/// Strip the `+1` prefix for display in forms. Non-normalized input is returned as-is.
pub fn national_number(normalized: &str) -> &str {
    match normalized.strip_prefix(COUNTRY_PREFIX) {
        Some(rest) if rest.len() == NATIONAL_DIGITS && rest.chars().all(|c| c.is_ascii_digit()) => {
            rest
        }
        _ => normalized,
    }
}

/// True when `value` is already in the wire format `+1` + 10 digits.
pub fn is_normalized_phone(value: &str) -> bool {
    national_number(value) != value
}

/// Validate email address format.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    if !email_regex().is_match(email) {
        tracing::debug!("❌ Invalid email format: {}", email);
        return false;
    }

    true
}

/// Trim, lower-case and validate an email. Blank input yields `Ok(None)`.
pub fn normalize_email(raw: &str) -> Result<Option<String>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let lowered = trimmed.to_lowercase();
    if !is_valid_email(&lowered) {
        return Err(format!("Invalid email address '{}'", raw));
    }

    Ok(Some(lowered))
}

/// Normalize an optional phone field, treating `None` and blank alike.
pub fn normalize_optional_phone(raw: Option<&str>) -> Result<Option<String>, String> {
    raw.map(normalize_phone).transpose().map(Option::flatten)
}

/// Normalize an optional email field, treating `None` and blank alike.
pub fn normalize_optional_email(raw: Option<&str>) -> Result<Option<String>, String> {
    raw.map(normalize_email).transpose().map(Option::flatten)
}
