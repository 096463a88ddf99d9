use crate::instance::RegionClass;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Control API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Instance journal location
    #[serde(default)]
    pub journal: JournalConfig,

    /// Proxy helper invocation
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Front-door (reverse proxy) refresh hook
    #[serde(default)]
    pub front_door: FrontDoorConfig,

    /// Restore policy
    #[serde(default)]
    pub restore: RestoreConfig,

    /// Port partition and upstream template per region class
    #[serde(default = "default_regions")]
    pub regions: HashMap<RegionClass, RegionConfig>,

    /// Upstream reseller integrations
    #[serde(default)]
    pub providers: ProvidersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            journal: JournalConfig::default(),
            launcher: LauncherConfig::default(),
            front_door: FrontDoorConfig::default(),
            restore: RestoreConfig::default(),
            regions: default_regions(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control API port (default: 9090)
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token for the control API.
    /// If not set, a random token is generated at startup and logged
    pub api_token: Option<String>,

    /// Domain the regional subdomains hang off (e.g. "usa.<base_domain>")
    #[serde(default)]
    pub base_domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_api_port(),
            api_token: None,
            base_domain: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct JournalConfig {
    /// Path of the JSON journal file
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: default_journal_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LauncherConfig {
    /// Proxy helper script. Defaults to `<exe_dir>/../scripts/create_proxy_plan.sh`
    pub helper_path: Option<PathBuf>,

    /// Interpreter used to run the helper; empty runs the helper directly
    #[serde(default = "default_helper_interpreter")]
    pub helper_interpreter: String,

    /// Max time the helper may take to start a proxy
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout_secs: u64,

    /// Timeout for a single localhost port probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            helper_interpreter: default_helper_interpreter(),
            spawn_timeout_secs: default_spawn_timeout(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl LauncherConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Configured helper path, or the default location next to the binary
    pub fn resolve_helper_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(ref path) = self.helper_path {
            return Ok(path.clone());
        }
        let exe = std::env::current_exe()?;
        let exe_dir = exe
            .parent()
            .ok_or_else(|| anyhow::anyhow!("executable path has no parent: {}", exe.display()))?;
        let base = exe_dir.parent().unwrap_or(exe_dir);
        Ok(base.join("scripts").join("create_proxy_plan.sh"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontDoorConfig {
    /// Command that re-reads instance state and updates public routing.
    /// Unset disables the refresh
    pub refresh_command: Option<String>,

    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

impl Default for FrontDoorConfig {
    fn default() -> Self {
        Self {
            refresh_command: None,
            refresh_timeout_secs: default_refresh_timeout(),
        }
    }
}

impl FrontDoorConfig {
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestoreConfig {
    /// Run a restore pass when the service starts (default: true)
    #[serde(default = "default_true")]
    pub on_startup: bool,

    /// Kill and relaunch instances whose port is already bound, even if healthy
    #[serde(default)]
    pub force_relaunch: bool,

    /// Pause after killing a stale port before relaunching
    #[serde(default = "default_kill_settle")]
    pub kill_settle_ms: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            on_startup: true,
            force_relaunch: false,
            kill_settle_ms: default_kill_settle(),
        }
    }
}

impl RestoreConfig {
    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.kill_settle_ms)
    }
}

/// Upstream target used when a missing regional sibling has to be synthesized
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UpstreamTemplate {
    pub host: String,
    /// Upstream port; copied from the existing sibling when unset
    pub port: Option<u16>,
    pub public_port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RegionConfig {
    /// First port of the partition (inclusive)
    pub range_start: u16,
    /// Last port of the partition (inclusive)
    pub range_end: u16,
    /// Counterpart region every non-expired instance must be paired with
    pub pair: Option<RegionClass>,
    /// Upstream template for synthesizing this region as a sibling
    pub upstream: Option<UpstreamTemplate>,
}

impl RegionConfig {
    pub fn range(start: u16, end: u16) -> Self {
        Self {
            range_start: start,
            range_end: end,
            pair: None,
            upstream: None,
        }
    }

    pub fn paired_with(mut self, pair: RegionClass, host: &str, public_port: u16) -> Self {
        self.pair = Some(pair);
        self.upstream = Some(UpstreamTemplate {
            host: host.to_string(),
            port: None,
            public_port,
        });
        self
    }

    pub fn capacity(&self) -> usize {
        (self.range_end as usize + 1).saturating_sub(self.range_start as usize)
    }

    fn validate(&self, region: RegionClass) -> Result<(), String> {
        if self.range_start == 0 || self.range_start > self.range_end {
            return Err(format!(
                "Region '{}': invalid port range {}-{}",
                region, self.range_start, self.range_end
            ));
        }
        if self.pair == Some(region) {
            return Err(format!("Region '{}': cannot be paired with itself", region));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub proxiesfo: ProxiesFoConfig,

    #[serde(default)]
    pub nettify: NettifyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxiesFoConfig {
    #[serde(default = "default_proxiesfo_url")]
    pub base_url: String,

    /// API key; falls back to the PROXIESFO_API_KEY environment variable
    pub api_key: Option<String>,
}

impl Default for ProxiesFoConfig {
    fn default() -> Self {
        Self {
            base_url: default_proxiesfo_url(),
            api_key: None,
        }
    }
}

impl ProxiesFoConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref(), "PROXIESFO_API_KEY")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NettifyConfig {
    #[serde(default = "default_nettify_url")]
    pub base_url: String,

    /// API key; falls back to the NETTIFY_API_KEY environment variable
    pub api_key: Option<String>,
}

impl Default for NettifyConfig {
    fn default() -> Self {
        Self {
            base_url: default_nettify_url(),
            api_key: None,
        }
    }
}

impl NettifyConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_secret(self.api_key.as_deref(), "NETTIFY_API_KEY")
    }
}

fn resolve_secret(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .filter(|v| !v.is_empty())
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("/opt/oceanproxy/app/backend/logs/proxies.json")
}

fn default_helper_interpreter() -> String {
    "bash".to_string()
}

fn default_spawn_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    1000 // 1 second per probe
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_kill_settle() -> u64 {
    1000 // let the kernel release the socket
}

fn default_true() -> bool {
    true
}

fn default_proxiesfo_url() -> String {
    "https://app.proxies.fo/api".to_string()
}

fn default_nettify_url() -> String {
    "https://api.nettify.xyz".to_string()
}

/// Static region partitions, 2000 ports each
pub fn default_regions() -> HashMap<RegionClass, RegionConfig> {
    HashMap::from([
        (
            RegionClass::Usa,
            RegionConfig::range(10000, 11999).paired_with(RegionClass::Eu, "pr-us.proxies.fo", 1337),
        ),
        (
            RegionClass::Eu,
            RegionConfig::range(12000, 13999).paired_with(RegionClass::Usa, "pr-eu.proxies.fo", 1338),
        ),
        (RegionClass::Alpha, RegionConfig::range(14000, 15999)),
        (RegionClass::Beta, RegionConfig::range(16000, 17999)),
        (RegionClass::Mobile, RegionConfig::range(18000, 19999)),
        (RegionClass::Unlim, RegionConfig::range(20000, 21999)),
        (RegionClass::Datacenter, RegionConfig::range(22000, 23999)),
    ])
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut regions: Vec<_> = self.regions.iter().collect();
        regions.sort_by_key(|(_, r)| r.range_start);

        for (region, cfg) in &regions {
            if let Err(e) = cfg.validate(**region) {
                errors.push(e);
            }

            if let Some(pair) = cfg.pair {
                match self.regions.get(&pair) {
                    None => errors.push(format!(
                        "Region '{}': paired region '{}' has no port partition",
                        region, pair
                    )),
                    Some(other) => {
                        if other.pair != Some(**region) {
                            errors.push(format!(
                                "Region '{}': pairing with '{}' is not symmetric",
                                region, pair
                            ));
                        }
                        if other.upstream.is_none() {
                            errors.push(format!(
                                "Region '{}': paired region '{}' needs an upstream template",
                                region, pair
                            ));
                        }
                    }
                }
            }
        }

        for window in regions.windows(2) {
            let (a, ac) = window[0];
            let (b, bc) = window[1];
            if bc.range_start <= ac.range_end {
                errors.push(format!(
                    "Regions '{}' and '{}' have overlapping port ranges",
                    a, b
                ));
            }
        }

        if self.launcher.probe_timeout_ms == 0 {
            errors.push("launcher.probe_timeout_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
