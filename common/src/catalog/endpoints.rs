// Tenant endpoint resolution: region table plus explicit overrides

use crate::config::TenantConfig;
use crate::errors::ValidationError;

/// Identity and API hosts for one hosting region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub iam_host: &'static str,
    pub api_host: &'static str,
}

pub const REGIONS: &[Region] = &[
    Region {
        name: "US",
        iam_host: "iam.checkmarx.net",
        api_host: "ast.checkmarx.net",
    },
    Region {
        name: "US2",
        iam_host: "us.iam.checkmarx.net",
        api_host: "us.ast.checkmarx.net",
    },
    Region {
        name: "EU",
        iam_host: "eu.iam.checkmarx.net",
        api_host: "eu.ast.checkmarx.net",
    },
    Region {
        name: "EU2",
        iam_host: "eu.iam.checkmarx.net",
        api_host: "eu-2ast.checkmarx.net",
    },
    Region {
        name: "ANZ",
        iam_host: "anz.iam.checkmarx.net",
        api_host: "anz.ast.checkmarx.net",
    },
    Region {
        name: "India",
        iam_host: "ind.iam.checkmarx.net",
        api_host: "ind.ast.checkmarx.net",
    },
    Region {
        name: "Singapore",
        iam_host: "sng.iam.checkmarx.net",
        api_host: "sng.ast.checkmarx.net",
    },
];

/// Case-insensitive region lookup
pub fn region(name: &str) -> Option<&'static Region> {
    REGIONS.iter().find(|r| r.name.eq_ignore_ascii_case(name.trim()))
}

/// Fully resolved URLs for one tenant. Base URLs always end in `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub token_url: String,
    pub admin_base: String,
    pub api_base: String,
}

impl Endpoints {
    pub fn for_region(tenant: &str, region: &Region) -> Self {
        Self {
            token_url: format!(
                "https://{}/auth/realms/{}/protocol/openid-connect/token",
                region.iam_host, tenant
            ),
            admin_base: format!("https://{}/auth/admin/realms/{}/", region.iam_host, tenant),
            api_base: format!("https://{}/api/", region.api_host),
        }
    }

    /// Region defaults with any explicit URL from configuration taking over
    pub fn resolve(tenant_name: &str, config: &TenantConfig) -> Result<Self, ValidationError> {
        let overrides_complete =
            config.auth_url.is_some() && config.admin_url.is_some() && config.api_url.is_some();

        let mut endpoints = match region(&config.region) {
            Some(r) => Self::for_region(tenant_name, r),
            None if overrides_complete => Self {
                token_url: String::new(),
                admin_base: String::new(),
                api_base: String::new(),
            },
            None => {
                return Err(ValidationError::InvalidFieldValue {
                    field: "tenant.region".to_string(),
                    reason: format!("unknown region '{}'", config.region),
                })
            }
        };

        if let Some(url) = &config.auth_url {
            endpoints.token_url = url.clone();
        }
        if let Some(url) = &config.admin_url {
            endpoints.admin_base = with_trailing_slash(url);
        }
        if let Some(url) = &config.api_url {
            endpoints.api_base = with_trailing_slash(url);
        }

        Ok(endpoints)
    }
}

fn with_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}
