use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;

/// Cores are booked in hundredths of a physical core; 100 == one core.
pub const CORE_POINTS_PER_CORE: u32 = 100;

/// Sentinel exit status reported when a frame never made it past launch setup.
pub const EXITSTATUS_FOR_FAILED_LAUNCH: i32 = 256;

/// Sentinel exit status reported when the NIMBY lock killed a frame.
pub const EXITSTATUS_FOR_NIMBY_KILL: i32 = 286;

/// Bounds on the host status report interval.
pub const RQD_MIN_PING_INTERVAL_SEC: u64 = 5;
pub const RQD_MAX_PING_INTERVAL_SEC: u64 = 30;

/// Ceiling for the boot-report exponential backoff.
pub const MAX_STARTUP_CONNECT_DELAY_SEC: u64 = 300;

/// Immutable daemon configuration.
///
/// Built once at startup from compiled-in defaults, the optional INI file
/// (`[Override]` and `[UseHostEnvVar]` sections), and command-line flags,
/// then handed to every component by reference. Components never read
/// configuration from anywhere else.
#[derive(Debug, Clone)]
pub struct RqdConfig {
    /// Inbound control endpoint bind port.
    pub rqd_port: u16,
    /// Scheduler base URL for outbound reports, e.g. `http://cuebot:8443`.
    pub cuebot_endpoint: String,

    /// Clamp probed core count (whole cores).
    pub override_cores: Option<u32>,
    /// Clamp probed socket count.
    pub override_procs: Option<u32>,
    /// Clamp probed total memory (kilobytes).
    pub override_memory_kb: Option<u64>,
    pub override_hostname: Option<String>,

    /// Whether the idle detector is enabled at all.
    pub nimby: bool,
    /// Desktop hosts nice their frames and default NIMBY on.
    pub desktop: bool,
    /// Enable GPU memory probing.
    pub gpu: bool,
    /// Additive adjustment to the normalised load average.
    pub load_modifier: i32,

    pub use_ip_as_hostname: bool,
    pub use_ipv6_as_hostname: bool,
    /// Frames inherit the host PATH instead of the baseline PATH.
    pub use_path_env_var: bool,
    /// Frames inherit the entire host environment.
    pub use_all_host_env_vars: bool,
    /// Drop privileges to the frame user before exec (requires root).
    pub become_job_user: bool,

    /// Free-form capability tags advertised on the host descriptor.
    pub tags: Vec<String>,
    pub facility: String,
    /// Fallback gid when the frame request carries none.
    pub launch_frame_user_gid: u32,

    pub console_log_level: String,
    pub file_log_level: String,
    /// Daemon log file; `None` means console logging only.
    pub file_log_path: Option<PathBuf>,

    /// Seconds between idle-detector checks while locked.
    pub check_interval_locked: u64,
    /// Seconds of input silence required before NIMBY unlocks.
    pub minimum_idle: u64,
    /// Free memory floor (kB) required before NIMBY unlocks.
    pub minimum_mem_kb: u64,
    /// Free swap floor (kB) required before NIMBY unlocks.
    pub minimum_swap_kb: u64,
    /// Normalised load ceiling required before NIMBY unlocks.
    pub maximum_load: u32,

    /// Where the running-frame snapshot is written; `None` disables it.
    pub backup_cache_path: Option<PathBuf>,
    /// Snapshot entries older than this are discarded on reconcile.
    pub backup_cache_ttl_secs: u64,

    /// Rotation cap: this many log files per frame name, live one included.
    pub max_log_files: u32,
    /// Seconds between process-tree rss/cpu sweeps.
    pub rss_update_interval_secs: u64,
    /// Seconds between host status reports.
    pub ping_interval_secs: u64,
    /// Initial boot-report retry delay (doubles up to the ceiling).
    pub startup_connect_delay_secs: u64,
    /// Retry delay for frame-complete reports.
    pub critical_report_delay_secs: u64,
    /// SIGTERM-to-SIGKILL grace when killing a frame.
    pub kill_grace_secs: u64,
    /// Sleep observed after a failed launch so a broken host cannot
    /// hot-loop through bookings.
    pub failed_launch_backoff_secs: u64,

    /// Host environment variable names propagated into frames
    /// (`[UseHostEnvVar]` keys, matched case-insensitively).
    pub host_env_vars: Vec<String>,
    /// Scratch root for per-frame temp directories.
    pub temp_path: PathBuf,
}

impl Default for RqdConfig {
    fn default() -> Self {
        Self {
            rqd_port: 8444,
            cuebot_endpoint: "http://localhost:8443".to_string(),
            override_cores: None,
            override_procs: None,
            override_memory_kb: None,
            override_hostname: None,
            nimby: false,
            desktop: false,
            gpu: false,
            load_modifier: 0,
            use_ip_as_hostname: false,
            use_ipv6_as_hostname: false,
            use_path_env_var: false,
            use_all_host_env_vars: false,
            become_job_user: true,
            tags: Vec::new(),
            facility: "cloud".to_string(),
            launch_frame_user_gid: 20,
            console_log_level: "info".to_string(),
            file_log_level: "warn".to_string(),
            file_log_path: None,
            check_interval_locked: 60,
            minimum_idle: 900,
            minimum_mem_kb: 262_144,
            minimum_swap_kb: 262_144,
            maximum_load: 75,
            backup_cache_path: None,
            backup_cache_ttl_secs: 3600,
            max_log_files: 15,
            rss_update_interval_secs: 10,
            ping_interval_secs: 30,
            startup_connect_delay_secs: 30,
            critical_report_delay_secs: 30,
            kill_grace_secs: 10,
            failed_launch_backoff_secs: 10,
            host_env_vars: Vec::new(),
            temp_path: default_temp_path(),
        }
    }
}

/// `/mcp` is the conventional render scratch partition; fall back to the
/// OS temp directory when it is not mounted.
pub fn default_temp_path() -> PathBuf {
    let mcp = PathBuf::from("/mcp");
    if mcp.is_dir() {
        mcp
    } else {
        std::env::temp_dir()
    }
}

/// `[Override]` section, raw. Every key is optional; INI readers may fold
/// key case, so each field accepts both spellings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IniOverride {
    #[serde(alias = "RQD_GRPC_PORT")]
    rqd_grpc_port: Option<u16>,
    #[serde(alias = "CUEBOT_GRPC_PORT")]
    cuebot_grpc_port: Option<u16>,
    #[serde(alias = "OVERRIDE_CUEBOT")]
    override_cuebot: Option<String>,
    #[serde(alias = "OVERRIDE_CORES")]
    override_cores: Option<u32>,
    #[serde(alias = "OVERRIDE_PROCS")]
    override_procs: Option<u32>,
    #[serde(alias = "OVERRIDE_MEMORY")]
    override_memory: Option<u64>,
    #[serde(alias = "OVERRIDE_HOSTNAME")]
    override_hostname: Option<String>,
    #[serde(alias = "OVERRIDE_NIMBY")]
    override_nimby: Option<bool>,
    #[serde(alias = "OVERRIDE_IS_DESKTOP")]
    override_is_desktop: Option<bool>,
    #[serde(alias = "GPU")]
    gpu: Option<bool>,
    #[serde(alias = "LOAD_MODIFIER")]
    load_modifier: Option<i32>,
    #[serde(alias = "RQD_USE_IP_AS_HOSTNAME")]
    rqd_use_ip_as_hostname: Option<bool>,
    #[serde(alias = "RQD_USE_IPV6_AS_HOSTNAME")]
    rqd_use_ipv6_as_hostname: Option<bool>,
    #[serde(alias = "RQD_USE_PATH_ENV_VAR")]
    rqd_use_path_env_var: Option<bool>,
    #[serde(alias = "RQD_USE_ALL_HOST_ENV_VARS")]
    rqd_use_all_host_env_vars: Option<bool>,
    #[serde(alias = "RQD_BECOME_JOB_USER")]
    rqd_become_job_user: Option<bool>,
    #[serde(alias = "RQD_TAGS")]
    rqd_tags: Option<String>,
    #[serde(alias = "DEFAULT_FACILITY")]
    default_facility: Option<String>,
    #[serde(alias = "LAUNCH_FRAME_USER_GID")]
    launch_frame_user_gid: Option<u32>,
    #[serde(alias = "CONSOLE_LOG_LEVEL")]
    console_log_level: Option<String>,
    #[serde(alias = "FILE_LOG_LEVEL")]
    file_log_level: Option<String>,
    #[serde(alias = "FILE_LOG_PATH")]
    file_log_path: Option<PathBuf>,
    #[serde(alias = "CHECK_INTERVAL_LOCKED")]
    check_interval_locked: Option<u64>,
    #[serde(alias = "MINIMUM_IDLE")]
    minimum_idle: Option<u64>,
    #[serde(alias = "MINIMUM_MEM")]
    minimum_mem: Option<u64>,
    #[serde(alias = "MINIMUM_SWAP")]
    minimum_swap: Option<u64>,
    #[serde(alias = "MAXIMUM_LOAD")]
    maximum_load: Option<u32>,
    #[serde(alias = "BACKUP_CACHE_PATH")]
    backup_cache_path: Option<PathBuf>,
    #[serde(alias = "BACKUP_CACHE_TIME_TO_LIVE_SECONDS")]
    backup_cache_time_to_live_seconds: Option<u64>,
    #[serde(alias = "MAX_LOG_FILES")]
    max_log_files: Option<u32>,
    #[serde(alias = "RSS_UPDATE_INTERVAL")]
    rss_update_interval: Option<u64>,
    #[serde(alias = "RQD_PING_INTERVAL")]
    rqd_ping_interval: Option<u64>,
    #[serde(alias = "RQD_RETRY_STARTUP_CONNECT_DELAY")]
    rqd_retry_startup_connect_delay: Option<u64>,
    #[serde(alias = "RQD_RETRY_CRITICAL_REPORT_DELAY")]
    rqd_retry_critical_report_delay: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IniFile {
    #[serde(rename = "override", alias = "Override")]
    overrides: IniOverride,
    #[serde(rename = "usehostenvvar", alias = "UseHostEnvVar")]
    use_host_env_var: HashMap<String, String>,
}

impl RqdConfig {
    /// Load configuration from an INI file layered over the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw: IniFile = Config::builder()
            .add_source(File::from(path.to_path_buf()).format(FileFormat::Ini))
            .build()?
            .try_deserialize()?;
        Ok(Self::from_ini(raw))
    }

    fn from_ini(raw: IniFile) -> Self {
        let mut cfg = Self::default();
        let o = raw.overrides;

        if let Some(v) = o.rqd_grpc_port {
            cfg.rqd_port = v;
        }
        match (o.override_cuebot, o.cuebot_grpc_port) {
            (Some(host), Some(port)) => {
                cfg.cuebot_endpoint = format!("http://{}:{}", host, port);
            }
            (Some(host), None) => {
                cfg.cuebot_endpoint = format!("http://{}:8443", host);
            }
            (None, Some(port)) => {
                cfg.cuebot_endpoint = format!("http://localhost:{}", port);
            }
            (None, None) => {}
        }
        cfg.override_cores = o.override_cores;
        cfg.override_procs = o.override_procs;
        cfg.override_memory_kb = o.override_memory;
        cfg.override_hostname = o.override_hostname;
        if let Some(v) = o.override_nimby {
            cfg.nimby = v;
        }
        if let Some(v) = o.override_is_desktop {
            cfg.desktop = v;
            // Desktops default to NIMBY on unless explicitly forced off.
            if o.override_nimby.is_none() {
                cfg.nimby = v;
            }
        }
        if let Some(v) = o.gpu {
            cfg.gpu = v;
        }
        if let Some(v) = o.load_modifier {
            cfg.load_modifier = v;
        }
        if let Some(v) = o.rqd_use_ip_as_hostname {
            cfg.use_ip_as_hostname = v;
        }
        if let Some(v) = o.rqd_use_ipv6_as_hostname {
            cfg.use_ipv6_as_hostname = v;
        }
        if let Some(v) = o.rqd_use_path_env_var {
            cfg.use_path_env_var = v;
        }
        if let Some(v) = o.rqd_use_all_host_env_vars {
            cfg.use_all_host_env_vars = v;
        }
        if let Some(v) = o.rqd_become_job_user {
            cfg.become_job_user = v;
        }
        if let Some(v) = o.rqd_tags {
            cfg.tags = v
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        if let Some(v) = o.default_facility {
            cfg.facility = v;
        }
        if let Some(v) = o.launch_frame_user_gid {
            cfg.launch_frame_user_gid = v;
        }
        if let Some(v) = o.console_log_level {
            cfg.console_log_level = v;
        }
        if let Some(v) = o.file_log_level {
            cfg.file_log_level = v;
        }
        if o.file_log_path.is_some() {
            cfg.file_log_path = o.file_log_path;
        }
        if let Some(v) = o.check_interval_locked {
            cfg.check_interval_locked = v;
        }
        if let Some(v) = o.minimum_idle {
            cfg.minimum_idle = v;
        }
        if let Some(v) = o.minimum_mem {
            cfg.minimum_mem_kb = v;
        }
        if let Some(v) = o.minimum_swap {
            cfg.minimum_swap_kb = v;
        }
        if let Some(v) = o.maximum_load {
            cfg.maximum_load = v;
        }
        cfg.backup_cache_path = o.backup_cache_path;
        if let Some(v) = o.backup_cache_time_to_live_seconds {
            cfg.backup_cache_ttl_secs = v;
        }
        if let Some(v) = o.max_log_files {
            cfg.max_log_files = v.max(1);
        }
        if let Some(v) = o.rss_update_interval {
            cfg.rss_update_interval_secs = v.max(1);
        }
        if let Some(v) = o.rqd_ping_interval {
            cfg.ping_interval_secs = v.clamp(RQD_MIN_PING_INTERVAL_SEC, RQD_MAX_PING_INTERVAL_SEC);
        }
        if let Some(v) = o.rqd_retry_startup_connect_delay {
            cfg.startup_connect_delay_secs = v.max(1);
        }
        if let Some(v) = o.rqd_retry_critical_report_delay {
            cfg.critical_report_delay_secs = v.max(1);
        }

        cfg.host_env_vars = raw.use_host_env_var.into_keys().collect();
        cfg.host_env_vars.sort();
        cfg
    }

    /// Look up a host environment variable by name, ignoring ASCII case.
    /// INI readers may fold key case, so `[UseHostEnvVar]` names cannot be
    /// trusted to match the environment exactly.
    pub fn host_env_value(name: &str) -> Option<(String, String)> {
        std::env::vars().find(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new()
            .suffix(".conf")
            .tempfile()
            .unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = RqdConfig::default();
        assert_eq!(cfg.rqd_port, 8444);
        assert_eq!(cfg.max_log_files, 15);
        assert_eq!(cfg.check_interval_locked, 60);
        assert!(cfg.backup_cache_path.is_none());
        assert!(!cfg.nimby);
    }

    #[test]
    fn load_override_section() {
        let f = write_ini(
            "[Override]\n\
             RQD_GRPC_PORT = 9444\n\
             OVERRIDE_CUEBOT = cuebot01\n\
             CUEBOT_GRPC_PORT = 9443\n\
             OVERRIDE_CORES = 16\n\
             OVERRIDE_MEMORY = 8388608\n\
             OVERRIDE_NIMBY = true\n\
             LOAD_MODIFIER = 5\n\
             RQD_TAGS = general, desktop\n\
             MAX_LOG_FILES = 4\n",
        );
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert_eq!(cfg.rqd_port, 9444);
        assert_eq!(cfg.cuebot_endpoint, "http://cuebot01:9443");
        assert_eq!(cfg.override_cores, Some(16));
        assert_eq!(cfg.override_memory_kb, Some(8_388_608));
        assert!(cfg.nimby);
        assert_eq!(cfg.load_modifier, 5);
        assert_eq!(cfg.tags, vec!["general", "desktop"]);
        assert_eq!(cfg.max_log_files, 4);
    }

    #[test]
    fn desktop_implies_nimby_unless_forced() {
        let f = write_ini("[Override]\nOVERRIDE_IS_DESKTOP = true\n");
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert!(cfg.desktop);
        assert!(cfg.nimby);

        let f = write_ini(
            "[Override]\nOVERRIDE_IS_DESKTOP = true\nOVERRIDE_NIMBY = false\n",
        );
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert!(cfg.desktop);
        assert!(!cfg.nimby);
    }

    #[test]
    fn file_logging_keys_take_effect() {
        let f = write_ini(
            "[Override]\n\
             FILE_LOG_LEVEL = debug\n\
             FILE_LOG_PATH = /var/log/rqd.log\n",
        );
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert_eq!(cfg.file_log_level, "debug");
        assert_eq!(cfg.file_log_path, Some(PathBuf::from("/var/log/rqd.log")));
    }

    #[test]
    fn host_env_var_section_collects_names() {
        let f = write_ini("[UseHostEnvVar]\nPATH =\nPYTHONPATH =\n");
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert_eq!(cfg.host_env_vars.len(), 2);
        assert!(cfg
            .host_env_vars
            .iter()
            .any(|k| k.eq_ignore_ascii_case("path")));
    }

    #[test]
    fn ping_interval_is_clamped() {
        let f = write_ini("[Override]\nRQD_PING_INTERVAL = 600\n");
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert_eq!(cfg.ping_interval_secs, RQD_MAX_PING_INTERVAL_SEC);

        let f = write_ini("[Override]\nRQD_PING_INTERVAL = 1\n");
        let cfg = RqdConfig::load(f.path()).unwrap();
        assert_eq!(cfg.ping_interval_secs, RQD_MIN_PING_INTERVAL_SEC);
    }
}
