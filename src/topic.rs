//! Routable names: the three-segment `org/namespace/name` identity used both
//! as an authenticated principal and as a pub/sub routing subject.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A three-segment routable identity, `org/namespace/local`.
///
/// The same value identifies a peer for authentication and addresses it for
/// routing. Segments must be non-empty; spaces are mangled to underscores so
/// display names survive as topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutableName {
    pub org: String,
    pub namespace: String,
    pub local: String,
}

impl RoutableName {
    pub fn new(
        org: impl Into<String>,
        namespace: impl Into<String>,
        local: impl Into<String>,
    ) -> Result<Self> {
        let name = Self {
            org: sanitize_topic(&org.into()),
            namespace: sanitize_topic(&namespace.into()),
            local: sanitize_topic(&local.into()),
        };
        if name.org.is_empty() || name.namespace.is_empty() || name.local.is_empty() {
            return Err(Error::Config(
                "routable name segments must be non-empty".to_string(),
            ));
        }
        Ok(name)
    }

    /// Resolve a topic against this name's org/namespace. A bare topic picks
    /// up the local org and namespace; a full `org/namespace/local` topic is
    /// parsed as-is.
    pub fn resolve(&self, topic: &str) -> Result<RoutableName> {
        match topic.parse::<RoutableName>() {
            Ok(name) => Ok(name),
            Err(_) => RoutableName::new(&self.org, &self.namespace, topic),
        }
    }
}

impl FromStr for RoutableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(org), Some(ns), Some(local)) => RoutableName::new(org, ns, local),
            _ => Err(Error::Config(format!(
                "routable name must be in the form 'org/namespace/local_name', got '{s}'"
            ))),
        }
    }
}

impl fmt::Display for RoutableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.org, self.namespace, self.local)
    }
}

/// Mangle a topic so it is valid on every transport: spaces become
/// underscores.
pub fn sanitize_topic(topic: &str) -> String {
    topic.trim().replace(' ', "_")
}

/// Encode a topic into a scheme-tagged URL, e.g. `slim://org/ns/name`.
pub fn topic_url(scheme: &str, topic: &str) -> String {
    format!("{scheme}://{topic}")
}

/// Extract the topic from a scheme-tagged URL. `slim://org/ns/name` and
/// `nats://name` both yield their authority+path component; plain topics are
/// returned unchanged.
pub fn topic_from_url(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => rest.trim_end_matches('/').to_string(),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_segments() {
        let name: RoutableName = "default/default/weather_server".parse().unwrap();
        assert_eq!(name.org, "default");
        assert_eq!(name.local, "weather_server");
        assert_eq!(name.to_string(), "default/default/weather_server");
    }

    #[test]
    fn rejects_short_and_empty_segments() {
        assert!("default/only-two".parse::<RoutableName>().is_err());
        assert!("a//c".parse::<RoutableName>().is_err());
    }

    #[test]
    fn sanitizes_spaces() {
        let name = RoutableName::new("default", "default", "Weather Agent").unwrap();
        assert_eq!(name.local, "Weather_Agent");
    }

    #[test]
    fn resolves_bare_topic_against_local_identity() {
        let me: RoutableName = "org/ns/client".parse().unwrap();
        let peer = me.resolve("weather").unwrap();
        assert_eq!(peer.to_string(), "org/ns/weather");

        let full = me.resolve("other/space/agent").unwrap();
        assert_eq!(full.to_string(), "other/space/agent");
    }

    #[test]
    fn url_round_trip() {
        let url = topic_url("slim", "default/default/agent1");
        assert_eq!(url, "slim://default/default/agent1");
        assert_eq!(topic_from_url(&url), "default/default/agent1");
        assert_eq!(topic_from_url("plain_topic"), "plain_topic");
    }
}
