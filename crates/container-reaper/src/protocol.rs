//! Registration wire format.
//!
//! A client registers a set of container filters by writing one line of
//! `key=value` pairs joined by `&`, terminated by `\n`:
//!
//! ```text
//! label=ephemeral.session-id=4f7c...&label=ephemeral.reap=true
//! ```
//!
//! The server answers every accepted line with `ACK\n`. Keys are Docker list
//! filter names; a label value is itself `labelkey=labelvalue`. The format is
//! the one spoken by the `testcontainers/ryuk` sidecar, so either side can be
//! swapped for it.

use crate::error::{Error, Result};
use container_runtime::ListFilter;
use std::fmt;
use std::str::FromStr;

/// Acknowledgement sent by the server after each registered line
pub const ACK: &str = "ACK\n";

/// Filter dimension understood by the reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterKey {
    /// `label=key=value` or `label=key`
    Label,
    /// Container id prefix
    Id,
    /// Container name
    Name,
}

impl FilterKey {
    fn as_str(&self) -> &'static str {
        match self {
            FilterKey::Label => "label",
            FilterKey::Id => "id",
            FilterKey::Name => "name",
        }
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "label" => Ok(FilterKey::Label),
            "id" => Ok(FilterKey::Id),
            "name" => Ok(FilterKey::Name),
            other => Err(Error::Protocol(format!("unsupported filter key '{}'", other))),
        }
    }
}

/// A set of conditions that together select the containers to reap.
///
/// Entries are kept sorted so that equal filters encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Filter {
    entries: Vec<(FilterKey, String)>,
}

impl Filter {
    /// An empty filter. It must gain at least one entry before it is sent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw entry
    pub fn with(mut self, key: FilterKey, value: impl Into<String>) -> Self {
        self.entries.push((key, value.into()));
        self.entries.sort();
        self.entries.dedup();
        self
    }

    /// Require `key=value` among the container labels
    pub fn label(self, key: &str, value: &str) -> Self {
        self.with(FilterKey::Label, format!("{}={}", key, value))
    }

    /// Select one container by id
    pub fn id(self, id: impl Into<String>) -> Self {
        self.with(FilterKey::Id, id)
    }

    /// Select containers by name
    pub fn name(self, name: impl Into<String>) -> Self {
        self.with(FilterKey::Name, name)
    }

    /// The entries in their canonical order
    pub fn entries(&self) -> &[(FilterKey, String)] {
        &self.entries
    }

    /// Check the filter can be sent and sweeps something narrower than everything
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::Protocol(
                "a filter needs at least one entry".to_string(),
            ));
        }
        for (key, value) in &self.entries {
            if value.is_empty() {
                return Err(Error::Protocol(format!("empty value for '{}'", key)));
            }
            if value.contains(['&', '\n', '\r']) {
                return Err(Error::Protocol(format!(
                    "value for '{}' contains a reserved character: {:?}",
                    key, value
                )));
            }
        }
        Ok(())
    }

    /// Encode as one registration line, including the trailing newline
    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        let mut line = self.to_string();
        line.push('\n');
        Ok(line)
    }

    /// Parse one registration line (without its newline)
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut filter = Filter::new();
        for pair in line.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::Protocol(format!("expected key=value, got '{}'", pair))
            })?;
            filter = filter.with(key.parse()?, value);
        }
        filter.validate()?;
        Ok(filter)
    }

    /// The runtime list query selecting every container this filter covers,
    /// stopped ones included
    pub fn to_list_filter(&self) -> ListFilter {
        self.entries
            .iter()
            .fold(ListFilter::all(), |filter, (key, value)| {
                filter.with(key.as_str(), value.clone())
            })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_canonical() {
        let a = Filter::new()
            .label("ephemeral.session-id", "s1")
            .label("ephemeral.reap", "true");
        let b = Filter::new()
            .label("ephemeral.reap", "true")
            .label("ephemeral.session-id", "s1");

        assert_eq!(a, b);
        assert_eq!(
            a.encode().unwrap(),
            "label=ephemeral.reap=true&label=ephemeral.session-id=s1\n"
        );
    }

    #[test]
    fn test_parse_splits_on_first_equals() {
        let filter = Filter::parse("label=ephemeral.session-id=s1&id=abc\r\n").unwrap();
        assert_eq!(
            filter.entries(),
            &[
                (FilterKey::Label, "ephemeral.session-id=s1".to_string()),
                (FilterKey::Id, "abc".to_string()),
            ]
        );

        let query = filter.to_list_filter();
        assert!(query.all);
        assert_eq!(query.filters["label"], vec!["ephemeral.session-id=s1"]);
        assert_eq!(query.filters["id"], vec!["abc"]);
    }

    #[test]
    fn test_rejects_malformed_lines() {
        assert!(Filter::parse("").is_err());
        assert!(Filter::parse("label").is_err());
        assert!(Filter::parse("volume=x").is_err());
        assert!(Filter::parse("id=").is_err());
    }

    #[test]
    fn test_rejects_reserved_characters() {
        assert!(Filter::new().name("a&b").encode().is_err());
        assert!(Filter::new().label("k", "line\nbreak").encode().is_err());
        assert!(Filter::new().encode().is_err());
    }
}
