use anyhow::Context;
use borg_ui_core::config::{AppConfig, WarnLevel};
use std::path::Path;

pub fn run(data_dir: &Path, port: u16, admin_password: Option<String>) -> anyhow::Result<()> {
    let config = AppConfig::load(data_dir).context("failed to load config")?;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("{}", w.message),
            WarnLevel::Error => tracing::error!("{}", w.message),
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(borg_ui_server::serve(config, port, admin_password))
}
