//! Normalized mint URLs.
//!
//! Every mint is identified by its normalized URL: lowercase scheme and
//! host, no default port, no trailing slash, no empty path segments.
//! Two spellings of the same mint always normalize to the same string,
//! which is what makes the URL usable as a primary key.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{ParseError, Url};

/// Mint url error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Url parse error
    #[error(transparent)]
    Url(#[from] ParseError),
    /// Invalid URL structure
    #[error("Invalid mint URL")]
    InvalidUrl,
    /// Unsupported scheme
    #[error("Unsupported URL scheme: `{0}`")]
    UnsupportedScheme(String),
}

/// Normalized mint URL
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MintUrl(String);

impl MintUrl {
    fn format_url(url: &str) -> Result<String, Error> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidUrl);
        }

        let parsed = Url::parse(trimmed)?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(Error::UnsupportedScheme(scheme.to_string()));
        }

        let host = parsed.host_str().ok_or(Error::InvalidUrl)?.to_lowercase();

        let mut formatted = format!("{scheme}://{host}");
        // `Url::port` is `None` when the port is the scheme default,
        // which drops `:443`/`:80` from the normalized form.
        if let Some(port) = parsed.port() {
            formatted.push_str(&format!(":{port}"));
        }

        let segments: Vec<&str> = parsed
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if !segments.is_empty() {
            formatted.push('/');
            formatted.push_str(&segments.join("/"));
        }

        Ok(formatted)
    }

    /// Append path elements onto the URL
    pub fn join_paths(&self, path_elements: &[&str]) -> Result<Url, Error> {
        let url = Url::parse(&self.0)?;
        let base_path = url.path().trim_end_matches('/');
        let mut joined = url.clone();
        joined.set_path(&format!("{}/{}", base_path, path_elements.join("/")));
        Ok(joined)
    }

    /// The normalized URL as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MintUrl {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        Self::format_url(url).map(Self)
    }
}

impl fmt::Display for MintUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MintUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MintUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MintUrl::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_trailing_slashes() {
        let very_unformatted_url = "http://url-to-check.com////";
        let unformatted_url = "http://url-to-check.com/";
        let formatted_url = "http://url-to-check.com";

        assert_eq!(
            formatted_url,
            MintUrl::from_str(very_unformatted_url).unwrap().to_string()
        );
        assert_eq!(
            formatted_url,
            MintUrl::from_str(unformatted_url).unwrap().to_string()
        );
        assert_eq!(
            formatted_url,
            MintUrl::from_str(formatted_url).unwrap().to_string()
        );
    }

    #[test]
    fn lowercases_host_but_not_path() {
        assert_eq!(
            "http://url-to-check.com",
            MintUrl::from_str("http://URL-to-check.com")
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "http://url-to-check.com/PATH/to/check",
            MintUrl::from_str("http://URL-to-check.com/PATH/to/check")
                .unwrap()
                .to_string()
        );
    }

    #[test]
    fn drops_default_ports() {
        assert_eq!(
            "https://mint.example.com",
            MintUrl::from_str("https://mint.example.com:443")
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "http://mint.example.com",
            MintUrl::from_str("http://mint.example.com:80")
                .unwrap()
                .to_string()
        );
        assert_eq!(
            "https://mint.example.com:3338",
            MintUrl::from_str("https://mint.example.com:3338")
                .unwrap()
                .to_string()
        );
    }

    #[test]
    fn collapses_redundant_segments() {
        assert_eq!(
            "https://mint.example.com/Bitcoin",
            MintUrl::from_str("https://mint.example.com//Bitcoin///")
                .unwrap()
                .to_string()
        );
    }

    #[test]
    fn slash_variants_are_equal() {
        let with_slash = MintUrl::from_str("https://mint.minibits.cash/Bitcoin/").unwrap();
        let without_slash = MintUrl::from_str("https://mint.minibits.cash/Bitcoin").unwrap();
        assert_eq!(with_slash, without_slash);
    }

    #[test]
    fn rejects_garbage() {
        assert!(MintUrl::from_str("").is_err());
        assert!(MintUrl::from_str("   ").is_err());
        assert!(MintUrl::from_str("not a url").is_err());
        assert!(MintUrl::from_str("ftp://mint.example.com").is_err());
    }

    #[test]
    fn join_paths_builds_endpoint_urls() {
        let url = MintUrl::from_str("http://mint.example.com").unwrap();
        assert_eq!(
            "http://mint.example.com/v1/keys",
            url.join_paths(&["v1", "keys"]).unwrap().to_string()
        );

        let url = MintUrl::from_str("http://mint.example.com/my/path").unwrap();
        assert_eq!(
            "http://mint.example.com/my/path/v1/keys",
            url.join_paths(&["v1", "keys"]).unwrap().to_string()
        );
    }
}
