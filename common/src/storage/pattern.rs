//! Key validation and wildcard key patterns.
//!
//! Bucket keys are dot-separated tokens:
//!
//! ```text
//! User.shard_3.42
//! User.index.email.alice_example_com
//! ```
//!
//! Patterns use the same token structure. `*` matches exactly one token and a
//! trailing `>` matches one or more remaining tokens, so `User.shard_3.>`
//! enumerates every record key in shard 3 of the `User` model.

use super::{StorageError, StorageResult};

const TOKEN_SEPARATOR: char = '.';
const SINGLE_WILDCARD: &str = "*";
const TAIL_WILDCARD: &str = ">";

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '=' | '.')
}

/// Checks that a key is accepted by the bucket.
///
/// Keys must be non-empty, use only `[A-Za-z0-9_=/.-]`, and must not contain
/// empty tokens (leading, trailing, or doubled dots).
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key is empty".to_string()));
    }
    if let Some(c) = key.chars().find(|c| !is_key_char(*c)) {
        return Err(StorageError::InvalidKey(format!(
            "key '{}' contains invalid character '{}'",
            key, c
        )));
    }
    if key.split(TOKEN_SEPARATOR).any(str::is_empty) {
        return Err(StorageError::InvalidKey(format!(
            "key '{}' contains an empty token",
            key
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A parsed key pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPattern {
    tokens: Vec<Token>,
}

impl KeyPattern {
    /// Parses a pattern, rejecting empty tokens and a `>` that is not last.
    pub fn parse(pattern: &str) -> StorageResult<Self> {
        if pattern.is_empty() {
            return Err(StorageError::InvalidKey("pattern is empty".to_string()));
        }

        let raw: Vec<&str> = pattern.split(TOKEN_SEPARATOR).collect();
        let mut tokens = Vec::with_capacity(raw.len());
        for (i, token) in raw.iter().enumerate() {
            let parsed = match *token {
                "" => {
                    return Err(StorageError::InvalidKey(format!(
                        "pattern '{}' contains an empty token",
                        pattern
                    )));
                }
                SINGLE_WILDCARD => Token::Single,
                TAIL_WILDCARD if i + 1 == raw.len() => Token::Tail,
                TAIL_WILDCARD => {
                    return Err(StorageError::InvalidKey(format!(
                        "pattern '{}' uses '>' before the last token",
                        pattern
                    )));
                }
                literal => {
                    if let Some(c) = literal.chars().find(|c| !is_key_char(*c)) {
                        return Err(StorageError::InvalidKey(format!(
                            "pattern '{}' contains invalid character '{}'",
                            pattern, c
                        )));
                    }
                    Token::Literal(literal.to_string())
                }
            };
            tokens.push(parsed);
        }

        Ok(Self { tokens })
    }

    /// Returns true if the key matches this pattern.
    pub fn matches(&self, key: &str) -> bool {
        let mut parts = key.split(TOKEN_SEPARATOR);
        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some(),
                Token::Single => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Token::Literal(expected) => match parts.next() {
                    Some(part) if part == expected => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    /// Returns the literal key prefix shared by every matching key.
    ///
    /// Used to narrow an ordered key scan before applying [`matches`](Self::matches).
    pub fn literal_prefix(&self) -> String {
        let mut prefix = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(literal) => {
                    prefix.push_str(literal);
                    prefix.push(TOKEN_SEPARATOR);
                }
                Token::Single | Token::Tail => return prefix,
            }
        }
        // fully literal pattern: the prefix is the key itself
        prefix.pop();
        prefix
    }
}
