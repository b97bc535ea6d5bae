//! # Structured Identifiers
//!
//! Participants, protocols, connections and skills are all named with the
//! same identifier shape: `author/name:version`, where `author` and `name`
//! are lowercased token strings and `version` is a dotted integer triple.
//! The canonical string form is also the wire representation, so parsing
//! and formatting must stay inverse of each other.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Opaque address of a participant (an agent or a service).
///
/// Addresses are treated as non-empty strings and never interpreted by the
/// runtime; connections are free to attach transport meaning to them.
pub type Address = String;

/// Identifier of a protocol contract over envelope payloads.
pub type ProtocolId = PublicId;

/// Identifier of a connection registered with a multiplexer.
pub type ConnectionId = PublicId;

/// Identifier of a skill, derived from an envelope's context URI.
pub type SkillId = PublicId;

/// Error raised when an identifier or URI fails format validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The string is not of the `author/name:major.minor.patch` shape.
    #[error("malformed public id '{0}', expected 'author/name:major.minor.patch'")]
    MalformedPublicId(String),
    /// The URI path does not hold an `author/name/version` triple.
    #[error("malformed public id uri path '{0}', expected 'author/name/major.minor.patch'")]
    MalformedUriPath(String),
    /// The string is not RFC3986 compliant.
    #[error("malformed uri '{raw}': {reason}")]
    MalformedUri {
        /// The offending raw string.
        raw: String,
        /// Why parsing rejected it.
        reason: String,
    },
}

static PUBLIC_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z_][a-z0-9_]*)/([a-z_][a-z0-9_]*):(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)$")
        .expect("public id pattern compiles")
});

static URI_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/?([a-z_][a-z0-9_]*)/([a-z_][a-z0-9_]*)/(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)$")
        .expect("uri path pattern compiles")
});

/// A semantic-version-like triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

impl Version {
    /// Create a version from its components.
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A structured `author/name:version` identifier.
///
/// Equality is structural over all three components, and the `Display`
/// form is the canonical string used on the wire and in routing tables.
///
/// ```
/// use agent_mailbox::PublicId;
///
/// let id: PublicId = "fetchai/default:0.1.0".parse().unwrap();
/// assert_eq!(id.author(), "fetchai");
/// assert_eq!(id.to_string(), "fetchai/default:0.1.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicId {
    author: String,
    name: String,
    version: Version,
}

impl PublicId {
    /// Build an identifier from raw components, validating the token rules.
    pub fn new(author: &str, name: &str, version: Version) -> Result<Self, ValidationError> {
        let candidate = format!("{}/{}:{}", author, name, version);
        candidate.parse()
    }

    /// Get the author token.
    pub fn author(&self) -> &str {
        &self.author
    }

    /// Get the name token.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the version triple.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Parse an identifier from a URI path of the form
    /// `author/name/major.minor.patch` (a leading slash is accepted).
    pub fn from_uri_path(path: &str) -> Result<Self, ValidationError> {
        let captures = URI_PATH_RE
            .captures(path)
            .ok_or_else(|| ValidationError::MalformedUriPath(path.to_string()))?;
        Ok(Self {
            author: captures[1].to_string(),
            name: captures[2].to_string(),
            version: Version::new(
                parse_component(&captures[3], path)?,
                parse_component(&captures[4], path)?,
                parse_component(&captures[5], path)?,
            ),
        })
    }
}

fn parse_component(text: &str, source: &str) -> Result<u32, ValidationError> {
    text.parse()
        .map_err(|_| ValidationError::MalformedPublicId(source.to_string()))
}

impl FromStr for PublicId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = PUBLIC_ID_RE
            .captures(s)
            .ok_or_else(|| ValidationError::MalformedPublicId(s.to_string()))?;
        Ok(Self {
            author: captures[1].to_string(),
            name: captures[2].to_string(),
            version: Version::new(
                parse_component(&captures[3], s)?,
                parse_component(&captures[4], s)?,
                parse_component(&captures[5], s)?,
            ),
        })
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.author, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let id: PublicId = "fetchai/default:0.1.0".parse().unwrap();
        assert_eq!(id.author(), "fetchai");
        assert_eq!(id.name(), "default");
        assert_eq!(id.version(), Version::new(0, 1, 0));
    }

    #[test]
    fn display_is_inverse_of_parse() {
        let raw = "some_author/some_name:1.22.333";
        let id: PublicId = raw.parse().unwrap();
        assert_eq!(id.to_string(), raw);
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for bad in [
            "",
            "fetchai",
            "fetchai/default",
            "fetchai/default:0.1",
            "Fetchai/default:0.1.0",
            "fetchai/9name:0.1.0",
            "fetchai/default:0.01.0",
            "fetchai/default:a.b.c",
        ] {
            assert!(bad.parse::<PublicId>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn parses_uri_path() {
        let id = PublicId::from_uri_path("/author/skill_name/0.1.0").unwrap();
        assert_eq!(id.to_string(), "author/skill_name:0.1.0");
        assert!(PublicId::from_uri_path("/just/two").is_err());
    }

    #[test]
    fn equality_is_structural() {
        let a: PublicId = "p/x:0.1.0".parse().unwrap();
        let b: PublicId = "p/x:0.1.0".parse().unwrap();
        let c: PublicId = "p/x:0.2.0".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
