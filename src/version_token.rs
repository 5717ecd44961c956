//! Canonical identity of an event position across name/id/stream/version.
//!
//! Mirrors the purpose of a typical event-sourcing crate's `version::Version`
//! alias, but widened into a compound key: a bare integer is not enough to
//! name a position globally, only within one already-known stream.

use std::fmt;
use std::str::FromStr;

/// Sentinel meaning "current head" rather than a concrete version.
///
/// Never produced by parsing a *persisted* event's version; only ever
/// constructed in memory via [`to_latest`].
pub const LATEST: i64 = i64::MAX;

const SEPARATOR: &str = "__";
const VERSION_WIDTH: usize = 20;

/// Globally meaningful identity of a single event: which object, which
/// stream incarnation of that object, and which version within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken {
    /// Logical entity type name, e.g. `"Order"`.
    pub object_name: String,
    /// Entity identifier, e.g. `"12345"`.
    pub object_id: String,
    /// Identifier of the stream incarnation, e.g. `"stream-abc"`.
    pub stream_identifier: String,
    /// Zero-based event version, or [`LATEST`].
    pub version: i64,
}

/// Error returned when a string does not conform to the VersionToken wire
/// format.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed version token `{input}`: {reason}")]
pub struct MalformedTokenError {
    /// The string that failed to parse.
    pub input: String,
    /// Why it was rejected.
    pub reason: String,
}

impl VersionToken {
    /// Builds a token derived from a committed event and the document it
    /// belongs to.
    #[must_use]
    pub fn from_event_and_document(
        object_name: &str,
        object_id: &str,
        stream_identifier: &str,
        event_version: i64,
    ) -> Self {
        Self {
            object_name: object_name.to_string(),
            object_id: object_id.to_string(),
            stream_identifier: stream_identifier.to_string(),
            version: event_version,
        }
    }

    /// Returns a copy of this token with `version` replaced by [`LATEST`].
    #[must_use]
    pub fn to_latest(&self) -> Self {
        Self {
            version: LATEST,
            ..self.clone()
        }
    }

    /// True when this token's version is the [`LATEST`] sentinel.
    #[must_use]
    pub fn is_latest(&self) -> bool {
        self.version == LATEST
    }
}

/// Parses a VersionToken from its canonical wire form:
/// `objectName__objectId__streamIdentifier__<version:20-digit-zero-padded>`.
///
/// Rejects any input that does not split into exactly four non-empty
/// `__`-delimited parts, or whose version segment is not exactly 20 decimal
/// digits.
pub fn parse_version_token(s: &str) -> Result<VersionToken, MalformedTokenError> {
    let parts: Vec<&str> = s.split(SEPARATOR).collect();

    if parts.len() != 4 {
        return Err(MalformedTokenError {
            input: s.to_string(),
            reason: format!("expected 4 `__`-delimited parts, found {}", parts.len()),
        });
    }

    let [object_name, object_id, stream_identifier, version_part] = [parts[0], parts[1], parts[2], parts[3]];

    if object_name.is_empty() || object_id.is_empty() || stream_identifier.is_empty() {
        return Err(MalformedTokenError {
            input: s.to_string(),
            reason: "object name, object id and stream identifier must be non-empty".to_string(),
        });
    }

    if version_part.len() != VERSION_WIDTH {
        return Err(MalformedTokenError {
            input: s.to_string(),
            reason: format!(
                "version segment must be exactly {VERSION_WIDTH} characters, found {}",
                version_part.len()
            ),
        });
    }

    let version: i64 = version_part.parse().map_err(|_| MalformedTokenError {
        input: s.to_string(),
        reason: "version segment is not a valid decimal integer".to_string(),
    })?;

    Ok(VersionToken {
        object_name: object_name.to_string(),
        object_id: object_id.to_string(),
        stream_identifier: stream_identifier.to_string(),
        version,
    })
}

/// Formats a VersionToken into its canonical wire form, zero-padding the
/// version to exactly 20 digits.
#[must_use]
pub fn format_version_token(t: &VersionToken) -> String {
    format!(
        "{}__{}__{}__{:0width$}",
        t.object_name,
        t.object_id,
        t.stream_identifier,
        t.version,
        width = VERSION_WIDTH
    )
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_version_token(self))
    }
}

impl FromStr for VersionToken {
    type Err = MalformedTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_version_token(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_well_formed_tokens() {
        let input = "Order__12345__stream-abc__00000000000000000042";
        let token = parse_version_token(input).expect("should parse");

        assert_eq!(
            token,
            VersionToken {
                object_name: "Order".to_string(),
                object_id: "12345".to_string(),
                stream_identifier: "stream-abc".to_string(),
                version: 42,
            }
        );
        assert_eq!(format_version_token(&token), input);
    }

    #[test]
    fn rejects_wrong_separator_count() {
        let err = parse_version_token("Order__x__s__42").expect_err("should reject");
        assert!(err.reason.contains("20 characters") || err.reason.contains("4"));
    }

    #[test]
    fn rejects_non_decimal_version() {
        let err = parse_version_token("Order__12345__stream-abc__notanumber00000000000")
            .expect_err("should reject");
        assert_eq!(err.input, "Order__12345__stream-abc__notanumber00000000000");
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(parse_version_token("__12345__stream-abc__00000000000000000042").is_err());
    }

    #[test]
    fn to_latest_sets_sentinel() {
        let token = VersionToken::from_event_and_document("Order", "12345", "stream-abc", 3);
        let latest = token.to_latest();
        assert!(latest.is_latest());
        assert_eq!(latest.object_name, token.object_name);
    }

    #[test]
    fn display_matches_format() {
        let token = VersionToken::from_event_and_document("Order", "12345", "stream-abc", 0);
        assert_eq!(token.to_string(), format_version_token(&token));
    }
}
