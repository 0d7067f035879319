use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File layout under the data directory
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "config.yaml";
pub const SETTINGS_FILE: &str = "settings.yaml";
pub const REGISTRY_FILE: &str = "registry.redb";
pub const ADMIN_PASSWORD_FILE: &str = "initial-admin-password";
pub const LOGS_DIR: &str = "logs";

pub const DEFAULT_DATA_DIR: &str = "/data";

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE)
}

pub fn registry_path(data_dir: &Path) -> PathBuf {
    data_dir.join(REGISTRY_FILE)
}

pub fn admin_password_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ADMIN_PASSWORD_FILE)
}

pub fn default_logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOGS_DIR)
}
