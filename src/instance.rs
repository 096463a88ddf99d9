//! Instance data model
//!
//! An [`Instance`] is one locally bound proxy process forwarding to one
//! upstream endpoint for one region of one purchased plan. Instances are the
//! records stored in the journal; everything else in the crate is derived
//! from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Region/tier label selecting a port partition and an upstream target shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum RegionClass {
    Usa,
    Eu,
    Alpha,
    Beta,
    Mobile,
    Unlim,
    Datacenter,
}

impl RegionClass {
    pub const ALL: [RegionClass; 7] = [
        RegionClass::Usa,
        RegionClass::Eu,
        RegionClass::Alpha,
        RegionClass::Beta,
        RegionClass::Mobile,
        RegionClass::Unlim,
        RegionClass::Datacenter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usa => "usa",
            Self::Eu => "eu",
            Self::Alpha => "alpha",
            Self::Beta => "beta",
            Self::Mobile => "mobile",
            Self::Unlim => "unlim",
            Self::Datacenter => "datacenter",
        }
    }
}

impl fmt::Display for RegionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegionClass::ALL
            .iter()
            .copied()
            .find(|r| r.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown region class: {}", s))
    }
}

impl TryFrom<String> for RegionClass {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Username/password pair shared verbatim by all region siblings of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// The real upstream proxy an instance forwards to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamEndpoint {
    pub host: String,
    pub port: u16,
    /// Port the upstream authenticates the plan's credentials on
    pub auth_port: u16,
}

/// One locally bound proxy process for one region of one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub plan_id: String,
    pub credentials: Credentials,
    pub region_class: RegionClass,
    pub upstream_endpoint: UpstreamEndpoint,
    /// Port the local proxy process binds to
    pub local_port: u16,
    /// Port advertised to clients; the front door maps it to `local_port`
    pub public_port: u16,
    /// Advertised hostname, `<region>.<base_domain>`
    #[serde(default)]
    pub local_host: String,
    pub created_at: i64,
    /// Unix timestamp, 0 means the plan never expires
    pub expires_at: i64,
}

impl Instance {
    /// Identifier used in logs and restore reports, e.g. `P1-eu`
    pub fn id(&self) -> String {
        instance_id(&self.plan_id, self.region_class)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at < now
    }

    /// Proxy URL handed back to clients
    pub fn client_url(&self) -> String {
        format!(
            "http://{}:{}@{}:{}",
            self.credentials.username, self.credentials.password, self.local_host, self.public_port
        )
    }

    pub fn client_endpoint(&self) -> String {
        format!("{}:{}", self.local_host, self.public_port)
    }
}

pub fn instance_id(plan_id: &str, region: RegionClass) -> String {
    format!("{}-{}", plan_id, region)
}

/// `<region>.<base_domain>`, or just the region when no domain is configured
pub fn local_host_for(region: RegionClass, base_domain: &str) -> String {
    if base_domain.is_empty() {
        region.to_string()
    } else {
        format!("{}.{}", region, base_domain)
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One region returned by an upstream provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub region_class: RegionClass,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_auth_port: u16,
    pub public_port: u16,
}

/// Normalized result of purchasing a plan from a reseller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDescriptor {
    pub plan_id: String,
    pub username: String,
    pub password: String,
    pub expires_at: i64,
    pub regions: Vec<RegionDescriptor>,
}
