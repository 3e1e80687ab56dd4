use std::fmt;

use thiserror::Error;

/// Number of characters in every [`ShortCode`].
pub const CODE_LENGTH: usize = 7;

/// `a-z`, `A-Z`, `0-9`.
pub const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Largest multiple of the alphabet size that fits in a byte.
/// Bytes at or above it are rejected so every symbol is equally likely.
const REJECTION_THRESHOLD: u8 = 248;

/// Codes that would be shadowed by a fixed route of the HTTP API.
const RESERVED_CODES: &[&str] = &["shorten"];

/// The public-facing key of a URL mapping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShortCode(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShortCodeValidationError {
    #[error("short code must be exactly {CODE_LENGTH} characters, got {actual}")]
    InvalidLength { actual: usize },
    #[error("short code contains characters outside [a-zA-Z0-9]: {invalid_chars}")]
    InvalidCharacters { invalid_chars: String },
}

/// The operating system could not supply secure random bytes.
#[derive(Debug, Error)]
#[error("secure random source failed: {0}")]
pub struct RandomSourceError(getrandom::Error);

impl ShortCode {
    /// Validates an externally supplied code.
    ///
    /// # Errors
    /// Will return [`Err`] if `code` is not [`CODE_LENGTH`] characters from [`ALPHABET`].
    pub fn new(code: String) -> Result<Self, ShortCodeValidationError> {
        let invalid_chars: String = code
            .chars()
            .filter(|c| !c.is_ascii_alphanumeric())
            .collect();
        if !invalid_chars.is_empty() {
            return Err(ShortCodeValidationError::InvalidCharacters { invalid_chars });
        }

        if code.len() != CODE_LENGTH {
            return Err(ShortCodeValidationError::InvalidLength { actual: code.len() });
        }

        Ok(Self(code))
    }

    /// Draws a fresh code from the OS CSPRNG.
    ///
    /// Uniqueness is not checked here; the store rejects duplicates.
    ///
    /// # Errors
    /// Will return [`Err`] if the OS random source fails.
    pub fn generate() -> Result<Self, RandomSourceError> {
        loop {
            let code = Self(random_symbols()?);
            if !RESERVED_CODES.contains(&code.as_str()) {
                return Ok(code);
            }
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ShortCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn random_symbols() -> Result<String, RandomSourceError> {
    let mut code = String::with_capacity(CODE_LENGTH);
    // NOTE: ~3% of bytes get rejected, so one buffer almost always suffices
    let mut buf = [0; 2 * CODE_LENGTH];

    while code.len() < CODE_LENGTH {
        getrandom::fill(&mut buf).map_err(RandomSourceError)?;
        code.extend(
            buf.iter()
                .filter(|&&b| b < REJECTION_THRESHOLD)
                .map(|&b| char::from(ALPHABET[usize::from(b) % ALPHABET.len()]))
                .take(CODE_LENGTH - code.len()),
        );
    }

    Ok(code)
}
