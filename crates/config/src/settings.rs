use std::path::PathBuf;
use std::time::Duration;

use keel_core::Backoff;

/// Operator runtime settings, read from `KEEL_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub backoff: Backoff,
    pub dry_run: bool,
    pub status_queue_cap: usize,
    pub status_conflict_retries: usize,
    pub availability_poll: Duration,
    pub bom_path: Option<PathBuf>,
    pub operator_version: Option<String>,
    pub install_namespace: String,
    pub helm_bin: String,
    pub dns_suffix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            dry_run: false,
            status_queue_cap: 1024,
            status_conflict_retries: 5,
            availability_poll: Duration::from_secs(45),
            bom_path: None,
            operator_version: None,
            install_namespace: "keel-install".to_string(),
            helm_bin: "helm".to_string(),
            dns_suffix: "nip.io".to_string(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key).map(Duration::from_secs).unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Settings::default();
        let backoff = Backoff {
            short_min: env_secs("KEEL_REQUEUE_MIN_SECS", d.backoff.short_min),
            short_max: env_secs("KEEL_REQUEUE_MAX_SECS", d.backoff.short_max),
            long_min: env_secs("KEEL_FAILURE_BACKOFF_MIN_SECS", d.backoff.long_min),
            long_max: env_secs("KEEL_FAILURE_BACKOFF_MAX_SECS", d.backoff.long_max),
        };
        Self {
            backoff,
            dry_run: std::env::var("KEEL_DRY_RUN").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
            status_queue_cap: env_parse("KEEL_STATUS_QUEUE_CAP").unwrap_or(d.status_queue_cap),
            status_conflict_retries: env_parse("KEEL_STATUS_CONFLICT_RETRIES").unwrap_or(d.status_conflict_retries),
            availability_poll: env_secs("KEEL_AVAILABILITY_POLL_SECS", d.availability_poll),
            bom_path: std::env::var("KEEL_BOM_PATH").ok().map(PathBuf::from),
            operator_version: std::env::var("KEEL_OPERATOR_VERSION").ok().filter(|v| !v.is_empty()),
            install_namespace: std::env::var("KEEL_INSTALL_NAMESPACE").unwrap_or(d.install_namespace),
            helm_bin: std::env::var("KEEL_HELM_BIN").unwrap_or(d.helm_bin),
            dns_suffix: std::env::var("KEEL_DNS_SUFFIX").unwrap_or(d.dns_suffix),
        }
    }
}
