use std::fmt;

/// A path as typed by a user: `user@service:/path` for namespace objects or a
/// plain local path.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LioPath {
    pub user: Option<String>,
    pub service: Option<String>,
    pub path: Option<String>,
    /// Set when the text carried an `@`, i.e. names a namespace object.
    pub is_lio: bool,
}

impl LioPath {
    /// Splits `text` at the first `@` and the first `:` after it. Every part
    /// is optional; empty parts come back as `None`.
    pub fn parse(text: &str) -> Self {
        let Some((user, rest)) = text.split_once('@') else {
            return Self {
                path: non_empty(text),
                ..Default::default()
            };
        };

        let (service, path) = match rest.split_once(':') {
            Some((service, path)) => (non_empty(service), non_empty(path)),
            None => (non_empty(rest), None),
        };
        Self {
            user: non_empty(user),
            service,
            path,
            is_lio: true,
        }
    }

    /// The object path, defaulting to the namespace root.
    pub fn path_or_root(&self) -> &str {
        self.path.as_deref().unwrap_or("/")
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Value of a timestamp attribute: `secs|id`, where the id names whoever
/// made the change and may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub id: Option<String>,
}

impl Timestamp {
    /// Splits an attribute value at the first `|`. A seconds field that is
    /// not a number reads as 0.
    pub fn parse(value: &str) -> Self {
        let (secs, id) = match value.split_once('|') {
            Some((secs, id)) => (secs, non_empty(id)),
            None => (value, None),
        };
        Self {
            secs: secs.trim().parse().unwrap_or(0),
            id,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}|{id}", self.secs),
            None => write!(f, "{}", self.secs),
        }
    }
}

impl fmt::Display for LioPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_lio {
            return write!(f, "{}", self.path.as_deref().unwrap_or_default());
        }
        write!(
            f,
            "{}@{}:{}",
            self.user.as_deref().unwrap_or_default(),
            self.service.as_deref().unwrap_or_default(),
            self.path.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path() {
        let p = LioPath::parse("alice@lserver:/data/x");
        assert!(p.is_lio);
        assert_eq!(p.user.as_deref(), Some("alice"));
        assert_eq!(p.service.as_deref(), Some("lserver"));
        assert_eq!(p.path.as_deref(), Some("/data/x"));
        assert_eq!(p.to_string(), "alice@lserver:/data/x");
    }

    #[test]
    fn test_optional_parts() {
        let p = LioPath::parse("@:/data");
        assert!(p.is_lio);
        assert_eq!((p.user, p.service), (None, None));
        assert_eq!(p.path.as_deref(), Some("/data"));

        let p = LioPath::parse("bob@svc");
        assert_eq!(p.service.as_deref(), Some("svc"));
        assert_eq!(p.path, None);
        assert_eq!(p.path_or_root(), "/");

        // only the first ':' after the '@' splits
        let p = LioPath::parse("@s:/a:b");
        assert_eq!(p.path.as_deref(), Some("/a:b"));
    }

    #[test]
    fn test_local_path() {
        let p = LioPath::parse("/tmp/local:file");
        assert!(!p.is_lio);
        assert_eq!(p.path.as_deref(), Some("/tmp/local:file"));
        assert_eq!(p.user, None);
    }

    #[test]
    fn test_timestamp() {
        let ts = Timestamp::parse("1700000000|alice");
        assert_eq!(ts.secs, 1_700_000_000);
        assert_eq!(ts.id.as_deref(), Some("alice"));
        assert_eq!(ts.to_string(), "1700000000|alice");

        let ts = Timestamp::parse("42");
        assert_eq!((ts.secs, ts.id.as_deref()), (42, None));
        assert_eq!(ts.to_string(), "42");

        assert_eq!(Timestamp::parse("junk|bob").secs, 0);
        assert_eq!(Timestamp::parse("5|").id, None);
        assert_eq!(Timestamp::parse("").secs, 0);
    }
}
