pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod format;
pub mod groups;
pub mod model;
pub mod orchestrator;
pub mod telegram;
pub mod walker;
pub mod zsxq;
