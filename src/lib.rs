pub mod alerts;
pub mod config;
pub mod ingest;
pub mod insights;
pub mod live;
pub mod rollup;
pub mod settings;
pub mod store;
