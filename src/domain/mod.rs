pub mod analytics;
pub mod models;
pub mod reconciler;
pub mod tracker;
