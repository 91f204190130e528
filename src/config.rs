use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Remote document store connection parameters.
#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub endpoint: String,
    pub project_id: String,
    pub api_key: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    /// `None` keeps the app local-only.
    pub cloud: Option<CloudConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let data_dir = non_empty("TASKBOARD_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data"));
        let enabled = non_empty("CLOUD_SYNC_ENABLED")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let poll_secs = non_empty("CLOUD_POLL_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()).unwrap_or(5);

        let cloud = if enabled {
            match (non_empty("CLOUD_ENDPOINT"), non_empty("CLOUD_PROJECT_ID")) {
                (Some(endpoint), Some(project_id)) => Some(CloudConfig {
                    endpoint,
                    project_id,
                    api_key: non_empty("CLOUD_API_KEY"),
                    poll_interval: Duration::from_secs(poll_secs.max(1)),
                }),
                _ => {
                    warn!("CLOUD_SYNC_ENABLED is set but CLOUD_ENDPOINT/CLOUD_PROJECT_ID are missing; staying local-only");
                    None
                }
            }
        } else {
            None
        };
        Self { data_dir, cloud }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(vars: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_are_local_only() {
        let c = cfg(&[]);
        assert_eq!(c.data_dir, PathBuf::from("data"));
        assert!(c.cloud.is_none());
    }

    #[test]
    fn cloud_requires_flag_and_connection_params() {
        assert!(cfg(&[("CLOUD_ENDPOINT", "http://x"), ("CLOUD_PROJECT_ID", "p")]).cloud.is_none());
        assert!(cfg(&[("CLOUD_SYNC_ENABLED", "true"), ("CLOUD_ENDPOINT", "http://x")]).cloud.is_none());
        let c = cfg(&[
            ("CLOUD_SYNC_ENABLED", "TRUE"),
            ("CLOUD_ENDPOINT", "http://x/"),
            ("CLOUD_PROJECT_ID", "board"),
            ("CLOUD_POLL_INTERVAL_SECS", "0"),
            ("TASKBOARD_DATA_DIR", "/tmp/tb"),
        ])
        .cloud
        .unwrap();
        assert_eq!(c.project_id, "board");
        assert_eq!(c.api_key, None);
        assert_eq!(c.poll_interval, Duration::from_secs(1));
    }
}
