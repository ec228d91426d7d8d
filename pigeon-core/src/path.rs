//! Dataset path encoding: the `pigeon-optics:/<source>/<user>:<name>`
//! grammar every stored or transported path uses. Components are
//! percent-encoded on the grammar's reserved characters, so any component
//! string round-trips through `encode`/`decode`.

use crate::error::{CoreError, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// The characters that are structural in the path grammar (plus `%`, the
/// escape character itself) and therefore must be percent-encoded inside a
/// component.
const SEGMENT_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'/').add(b':');

fn escape(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_SET).to_string()
}

fn unescape(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| CoreError::validation(format!("invalid percent-encoding in path segment: {e}")))
}

/// A decoded `pigeon-optics:/<source>/<user>:<name>[/<recordID>]` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetPath {
    pub source: String,
    pub user: String,
    pub name: String,
    pub record_id: Option<String>,
}

impl DatasetPath {
    pub fn new(source: impl Into<String>, user: impl Into<String>, name: impl Into<String>) -> Self {
        DatasetPath {
            source: source.into(),
            user: user.into(),
            name: name.into(),
            record_id: None,
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// `path.encode(source, user, name, [recordID])`. Reserved characters
    /// inside each component are percent-encoded.
    pub fn encode(&self) -> String {
        let mut out = format!(
            "pigeon-optics:/{}/{}:{}",
            escape(&self.source),
            escape(&self.user),
            escape(&self.name)
        );
        if let Some(id) = &self.record_id {
            out.push('/');
            out.push_str(&escape(id));
        }
        out
    }

    /// Inverse of [`DatasetPath::encode`].
    pub fn decode(encoded: &str) -> Result<Self> {
        let rest = encoded.strip_prefix("pigeon-optics:/").ok_or_else(|| {
            CoreError::validation(format!("not a pigeon-optics path: {encoded}"))
        })?;
        let mut segments = rest.splitn(2, '/');
        let source = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::validation(format!("missing source in path: {encoded}")))?;
        let remainder = segments.next().unwrap_or("");
        let (user_name, record_id) = match remainder.split_once('/') {
            Some((un, rid)) => (un, Some(rid)),
            None => (remainder, None),
        };
        let (user, name) = user_name
            .split_once(':')
            .ok_or_else(|| CoreError::validation(format!("missing user:name in path: {encoded}")))?;
        if user.is_empty() || name.is_empty() {
            return Err(CoreError::validation(format!(
                "empty user or name in path: {encoded}"
            )));
        }
        Ok(DatasetPath {
            source: unescape(source)?,
            user: unescape(user)?,
            name: unescape(name)?,
            record_id: record_id.map(unescape).transpose()?,
        })
    }

    /// `[source, user, name]` key used to namespace a dataset's file-store
    /// entries (meta, objects).
    pub fn dataset_key(&self) -> [String; 3] {
        [self.source.clone(), self.user.clone(), self.name.clone()]
    }
}

impl std::fmt::Display for DatasetPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_without_record_id() {
        let p = DatasetPath::new("twitter", "alice", "tweets");
        assert_eq!(p.encode(), "pigeon-optics:/twitter/alice:tweets");
    }

    #[test]
    fn encode_with_record_id() {
        let p = DatasetPath::new("twitter", "alice", "tweets").with_record("123");
        assert_eq!(p.encode(), "pigeon-optics:/twitter/alice:tweets/123");
    }

    #[test]
    fn decode_round_trips() {
        let p = DatasetPath::new("twitter", "alice", "tweets").with_record("123");
        let decoded = DatasetPath::decode(&p.encode()).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert!(DatasetPath::decode("not-a-path").is_err());
        assert!(DatasetPath::decode("pigeon-optics:/source/nouserornamehere").is_err());
    }

    #[test]
    fn encode_escapes_reserved_characters() {
        let p = DatasetPath::new("twitter", "user:name", "a/b");
        assert_eq!(p.encode(), "pigeon-optics:/twitter/user%3Aname:a%2Fb");
    }

    #[test]
    fn reserved_characters_round_trip() {
        let p = DatasetPath::new("feed/archive", "a:lice", "100% tweets")
            .with_record("2024/01: a record");
        let decoded = DatasetPath::decode(&p.encode()).unwrap();
        assert_eq!(p, decoded);
    }

    #[test]
    fn decode_rejects_broken_percent_encoding() {
        assert!(DatasetPath::decode("pigeon-optics:/s/u:n/%ff").is_err());
    }
}
