//! Parsing of enrollment labels into a user ID and display name.
//!
//! The canonical label written by enrollment is ID-first:
//! `"117 - Jane Doe"`. Older enrollment sets used ID-last labels
//! (`"Jane Doe 117"`), which are still accepted as legacy input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no numeric user id in label {label:?}")]
pub struct ParseError {
    pub label: String,
}

/// A resolved kiosk user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub display_name: String,
}

impl Identity {
    /// First token of the display name, used for greetings.
    pub fn first_name(&self) -> &str {
        self.display_name
            .split_whitespace()
            .next()
            .unwrap_or(&self.display_name)
    }

    /// Canonical enrollment label for this identity.
    pub fn canonical_label(&self) -> String {
        format!("{} - {}", self.user_id, self.display_name)
    }
}

/// A single label convention. Each returns `None` if the label does not follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelFormat {
    /// `"<id> - <first> <last>"`
    IdFirst,
    /// `"<first> <last> <id>"`
    IdLast,
}

impl LabelFormat {
    pub fn parse(self, raw: &str) -> Option<Identity> {
        match self {
            LabelFormat::IdFirst => {
                let (id, name) = raw.split_once(" - ")?;
                Some(Identity {
                    user_id: parse_user_id(id.trim())?,
                    display_name: normalize_name(name.split_whitespace())?,
                })
            }
            LabelFormat::IdLast => {
                let mut tokens: Vec<&str> = raw.split_whitespace().collect();
                let id = parse_user_id(tokens.pop()?)?;
                Some(Identity {
                    user_id: id,
                    display_name: normalize_name(tokens.into_iter())?,
                })
            }
        }
    }
}

fn parse_user_id(token: &str) -> Option<i64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn normalize_name<'a>(tokens: impl Iterator<Item = &'a str>) -> Option<String> {
    let name = tokens.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Ordered set of label formats; the first format that parses wins.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    formats: Vec<LabelFormat>,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            formats: vec![LabelFormat::IdFirst, LabelFormat::IdLast],
        }
    }
}

impl IdentityResolver {
    pub fn new(formats: Vec<LabelFormat>) -> Self {
        Self { formats }
    }

    pub fn resolve(&self, raw: &str) -> Result<Identity, ParseError> {
        let raw = raw.trim();
        self.formats
            .iter()
            .find_map(|format| format.parse(raw))
            .ok_or_else(|| ParseError {
                label: raw.to_string(),
            })
    }
}

/// Resolve a label with the default format order (ID-first, then legacy ID-last).
pub fn resolve(raw: &str) -> Result<Identity, ParseError> {
    IdentityResolver::default().resolve(raw)
}
