pub mod admin;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod housekeeping;
pub mod io;
pub mod logs;
pub mod paths;
pub mod probe;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod settings;
pub mod supervisor;
pub mod sysinfo;
pub mod task_group;

pub use error::{BorgUiError, Result};
pub use services::Services;
pub use supervisor::{Lifecycle, StartupReport, Supervisor, SupervisorConfig};
