use axum::extract::State;
use axum::Json;
use borg_ui_core::supervisor::SchedulerSnapshot;

use crate::state::AppState;

/// GET /api/system/tasks: the launched schedulers and what each is doing.
/// Empty until startup has launched them; after shutdown every entry
/// reports `stopped`.
pub async fn list_tasks(State(app): State<AppState>) -> Json<Vec<SchedulerSnapshot>> {
    Json(app.supervisor.scheduler_states())
}
