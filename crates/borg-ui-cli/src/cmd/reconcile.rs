use crate::output::{print_json, print_table};
use anyhow::Context;
use borg_ui_core::config::AppConfig;
use borg_ui_core::reconcile::ReconcileReport;
use borg_ui_core::Services;
use std::path::Path;

pub fn run(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let config = AppConfig::load(data_dir).context("failed to load config")?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let services = Services::open(&config, None)?;
        services
            .reconciler(config.reconciler.verify_attempts, config.verify_delay())
            .reconcile_all()
            .await
    })?;

    if json {
        print_json(&report)
    } else {
        print_report(&report);
        Ok(())
    }
}

fn ids(ids: &[u64]) -> String {
    if ids.is_empty() {
        "-".to_string()
    } else {
        ids.iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn print_report(report: &ReconcileReport) {
    let jobs = &report.jobs;
    let mounts = &report.mounts;
    print_table(
        &["RESOURCE", "CHECKED", "LIVE", "RECOVERED", "UNVERIFIED", "ERRORS"],
        &[
            vec![
                "jobs".to_string(),
                jobs.checked.to_string(),
                jobs.alive.to_string(),
                ids(&jobs.orphaned),
                ids(&jobs.unverified),
                jobs.errors.to_string(),
            ],
            vec![
                "mounts".to_string(),
                mounts.checked.to_string(),
                mounts.mounted.to_string(),
                ids(&mounts.stale),
                ids(&mounts.unverified),
                mounts.errors.to_string(),
            ],
        ],
    );
    if mounts.unmount_failed > 0 {
        println!(
            "\n{} stale mount(s) could not be detached; check for busy mount points.",
            mounts.unmount_failed
        );
    }
}
