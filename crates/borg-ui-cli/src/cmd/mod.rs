pub mod config;
pub mod migrate;
pub mod reconcile;
pub mod serve;
