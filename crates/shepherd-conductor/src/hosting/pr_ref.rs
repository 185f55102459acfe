use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// `owner/name` of a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl RepoSlug {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A parsed pull-request reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrRef {
    /// Host from a full URL; `None` for the `owner/repo#n` short form.
    pub host: Option<String>,
    pub repo: RepoSlug,
    pub number: u64,
}

impl fmt::Display for PrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrRefError {
    #[error("empty pull request reference")]
    Empty,
    #[error("unrecognized pull request reference \"{0}\" (expected https://<host>/<owner>/<repo>/pull/<n> or <owner>/<repo>#<n>)")]
    Unrecognized(String),
    #[error("pull request number must be positive: \"{0}\"")]
    BadNumber(String),
}

fn url_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://([^/\s]+)/([^/\s]+)/([^/\s]+)/pulls?/(\d+)(?:[/?#].*)?$").ok()
    })
    .as_ref()
}

fn short_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+)#(\d+)$").ok())
        .as_ref()
}

impl std::str::FromStr for PrRef {
    type Err = PrRefError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let s = input.trim();
        if s.is_empty() {
            return Err(PrRefError::Empty);
        }

        let (host, owner, name, number) = if let Some(c) = url_re().and_then(|re| re.captures(s)) {
            (Some(c[1].to_string()), c[2].to_string(), c[3].to_string(), c[4].to_string())
        } else if let Some(c) = short_re().and_then(|re| re.captures(s)) {
            (None, c[1].to_string(), c[2].to_string(), c[3].to_string())
        } else {
            return Err(PrRefError::Unrecognized(s.to_string()));
        };

        let number: u64 = number
            .parse()
            .map_err(|_| PrRefError::BadNumber(s.to_string()))?;
        if number == 0 {
            return Err(PrRefError::BadNumber(s.to_string()));
        }
        let name = name.strip_suffix(".git").unwrap_or(&name).to_string();

        Ok(PrRef {
            host,
            repo: RepoSlug::new(owner, name),
            number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let r: PrRef = "https://github.com/acme/widgets/pull/42".parse().unwrap();
        assert_eq!(r.host.as_deref(), Some("github.com"));
        assert_eq!(r.repo, RepoSlug::new("acme", "widgets"));
        assert_eq!(r.number, 42);
    }

    #[test]
    fn parse_url_with_trailing_path() {
        let r: PrRef = "https://github.com/acme/widgets/pull/42/files".parse().unwrap();
        assert_eq!(r.number, 42);
        let r: PrRef = "https://ghe.corp.net/acme/widgets/pull/7#discussion_r1"
            .parse()
            .unwrap();
        assert_eq!(r.host.as_deref(), Some("ghe.corp.net"));
        assert_eq!(r.number, 7);
    }

    #[test]
    fn parse_short_form() {
        let r: PrRef = "acme/widgets#42".parse().unwrap();
        assert!(r.host.is_none());
        assert_eq!(r.to_string(), "acme/widgets#42");
    }

    #[test]
    fn parse_trims_whitespace() {
        let r: PrRef = "  acme/widgets#3\n".parse().unwrap();
        assert_eq!(r.number, 3);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!("".parse::<PrRef>(), Err(PrRefError::Empty));
        assert!(matches!(
            "acme/widgets".parse::<PrRef>(),
            Err(PrRefError::Unrecognized(_))
        ));
        assert!(matches!(
            "https://github.com/acme/widgets/issues/4".parse::<PrRef>(),
            Err(PrRefError::Unrecognized(_))
        ));
    }

    #[test]
    fn rejects_zero() {
        assert!(matches!(
            "acme/widgets#0".parse::<PrRef>(),
            Err(PrRefError::BadNumber(_))
        ));
    }
}
