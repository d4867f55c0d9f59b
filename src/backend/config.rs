use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "ehviewer-tui";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub user_agent: String,
    pub cache_dir: PathBuf,
    pub download_dir: PathBuf,
    pub task_list_path: PathBuf,
    pub memory_cache_bytes: usize,
    pub disk_cache_bytes: u64,
    /// Attempts per page before it is marked failed.
    pub max_retry: u32,
    /// Pages prefetched on each side of the current index.
    pub prefetch_window: usize,
    /// Ready pages farther than this from the current index drop their payload.
    pub reclaim_distance: usize,
    pub fetch_workers: usize,
    pub download_parallelism: usize,
    pub http_timeout_secs: u64,
    pub max_redirects: usize,
    pub speed_window_ms: u64,
}

fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn app_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn get_settings_path() -> PathBuf {
    let config_dir = app_config_dir();
    fs::create_dir_all(&config_dir).ok();
    config_dir.join("settings.json")
}

impl Default for Settings {
    fn default() -> Self {
        let download_root = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Settings {
            base_url: "https://e-hentai.org".to_string(),
            user_agent: "ehviewer-tui/0.1.0".to_string(),
            cache_dir: app_cache_dir().join("images"),
            download_dir: download_root.join("EhViewer"),
            task_list_path: app_config_dir().join("downloads.json"),
            memory_cache_bytes: 64 * 1024 * 1024,
            disk_cache_bytes: 256 * 1024 * 1024,
            max_retry: 3,
            prefetch_window: 2,
            reclaim_distance: 8,
            fetch_workers: 3,
            download_parallelism: 1,
            http_timeout_secs: 20,
            max_redirects: 5,
            speed_window_ms: 2000,
        }
    }
}

impl Settings {
    pub fn load() -> Self {
        let path = get_settings_path();

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(settings) => return settings,
                    Err(e) => log::warn!("Ignoring malformed {}: {}", path.display(), e),
                },
                Err(e) => log::warn!("Could not read {}: {}", path.display(), e),
            }
        }

        Settings::default()
    }

    pub fn save(&self) {
        let path = get_settings_path();
        if let Ok(content) = serde_json::to_string_pretty(self) {
            if let Err(e) = fs::write(&path, content) {
                log::warn!("Could not write {}: {}", path.display(), e);
            }
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_millis(self.speed_window_ms)
    }

    /// Settings rooted in a scratch directory, used by tests.
    #[cfg(test)]
    pub fn rooted_at(root: &std::path::Path) -> Self {
        Settings {
            cache_dir: root.join("cache"),
            download_dir: root.join("downloads"),
            task_list_path: root.join("downloads.json"),
            ..Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behavior() {
        let settings = Settings::default();
        assert_eq!(settings.max_retry, 3);
        assert_eq!(settings.fetch_workers, 3);
        assert_eq!(settings.max_redirects, 5);
        assert_eq!(settings.http_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"max_retry": 5}"#).unwrap();
        assert_eq!(settings.max_retry, 5);
        assert_eq!(settings.prefetch_window, Settings::default().prefetch_window);
    }
}
