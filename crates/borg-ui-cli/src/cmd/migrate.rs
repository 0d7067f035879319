use crate::output::print_json;
use anyhow::Context;
use borg_ui_core::io::ensure_dir;
use borg_ui_core::paths;
use borg_ui_core::registry::RedbRegistry;
use std::path::Path;

pub fn run(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    ensure_dir(data_dir).context("failed to create data directory")?;
    let path = paths::registry_path(data_dir);

    let rt = tokio::runtime::Runtime::new()?;
    let (applied, version) = rt.block_on(async {
        let registry = RedbRegistry::open(&path)?;
        let applied = registry.apply_migrations().await?;
        let version = registry.schema_version().await?;
        Ok::<_, borg_ui_core::BorgUiError>((applied, version))
    })
    .with_context(|| format!("failed to migrate {}", path.display()))?;

    if json {
        print_json(&serde_json::json!({
            "applied": applied,
            "schema_version": version,
        }))?;
    } else if applied == 0 {
        println!("Registry is up to date (schema version {version}).");
    } else {
        println!("Applied {applied} migration(s); schema version is now {version}.");
    }
    Ok(())
}
