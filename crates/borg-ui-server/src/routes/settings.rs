use axum::extract::State;
use axum::Json;
use borg_ui_core::cache::{redact_url, CacheStatus, ReconfigureOutcome};
use borg_ui_core::settings::MAX_CACHE_TTL_MINUTES;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CacheSettingsView {
    /// Credentials are masked.
    pub redis_url: Option<String>,
    pub max_size_mb: u64,
    pub ttl_minutes: u64,
    pub active: CacheStatus,
}

/// GET /api/settings/cache: persisted cache settings and the backend
/// actually serving requests, which differ after a fallback.
pub async fn get_cache_settings(
    State(app): State<AppState>,
) -> Result<Json<CacheSettingsView>, AppError> {
    let services = app.supervisor.services();
    let config = services.settings.fetch_cache_config().await?;
    Ok(Json(CacheSettingsView {
        redis_url: config.backend_target.as_deref().map(redact_url),
        max_size_mb: config.max_size_mb,
        ttl_minutes: config.ttl_minutes,
        active: services.cache.status(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCacheSettingsBody {
    /// Absent keeps the current target; an empty string selects the
    /// in-process cache.
    #[serde(default)]
    redis_url: Option<String>,
    #[serde(default)]
    max_size_mb: Option<u64>,
    #[serde(default)]
    ttl_minutes: Option<u64>,
}

/// PUT /api/settings/cache: persist new cache settings and switch the live
/// cache over. An unreachable target is not an error: the response reports
/// the fallback.
pub async fn put_cache_settings(
    State(app): State<AppState>,
    Json(body): Json<UpdateCacheSettingsBody>,
) -> Result<Json<ReconfigureOutcome>, AppError> {
    let services = app.supervisor.services();
    let mut config = services.settings.fetch_cache_config().await?;

    if let Some(url) = body.redis_url {
        let url = url.trim();
        config.backend_target = (!url.is_empty()).then(|| url.to_string());
    }
    if let Some(size) = body.max_size_mb {
        if size == 0 {
            return Err(AppError::bad_request("max_size_mb must be greater than 0"));
        }
        config.max_size_mb = size;
    }
    if let Some(ttl) = body.ttl_minutes {
        if ttl > MAX_CACHE_TTL_MINUTES {
            return Err(AppError::bad_request(format!(
                "ttl_minutes must be at most {MAX_CACHE_TTL_MINUTES}"
            )));
        }
        config.ttl_minutes = ttl;
    }

    services.settings.update_cache_config(&config).await?;
    let outcome = services.cache.apply(&config).await;
    tracing::info!(
        backend = %outcome.backend,
        success = outcome.success,
        "cache settings updated"
    );
    Ok(Json(outcome))
}
