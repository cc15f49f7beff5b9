// Clone URL parsing for repository-manager scan submission
//
// The repo-manager scan endpoint is addressed by SCM organization, which is
// only available embedded in the clone URL.

use regex::Regex;
use std::sync::OnceLock;

/// Parts extracted from a clone URL; any of them may be absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloneUrl {
    pub scheme: Option<String>,
    pub credentials: Option<String>,
    pub org: Option<String>,
    pub repo: Option<String>,
}

fn bitbucket_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<scheme>[^:/]+)://(?:(?P<cred>[^@/]+)@)?[^/]+(?:/.*)?/(?:scm/)?(?P<org>[^/]+)/(?P<repo>[^/]+?)\.git$",
        )
        .expect("Invalid regex pattern")
    })
}

fn azure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(?P<scheme>[^:/]+)://(?:(?P<cred>[^@/]+)@)?[^/]+(?:/.*)?/(?P<org>[^/]+)/(?P<project>[^/]+)/_git/(?P<repo>[^/]+?)(?:\.git)?$",
        )
        .expect("Invalid regex pattern")
    })
}

fn default_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^.*[/:](?P<org>[^/:]+)/(?P<repo>[^/]+?)(?:\.git)?$")
            .expect("Invalid regex pattern")
    })
}

impl CloneUrl {
    /// Parse a clone URL using the layout of the given SCM type
    pub fn parse(scm_type: &str, clone_url: &str) -> Self {
        let pattern = match scm_type.to_lowercase().as_str() {
            "bitbucket" => bitbucket_pattern(),
            "azure" => azure_pattern(),
            _ => default_pattern(),
        };

        let Some(captures) = pattern.captures(clone_url) else {
            return Self::default();
        };

        let group = |name: &str| captures.name(name).map(|m| m.as_str().to_string());

        Self {
            scheme: group("scheme"),
            credentials: group("cred"),
            org: group("org"),
            repo: group("repo"),
        }
    }
}
