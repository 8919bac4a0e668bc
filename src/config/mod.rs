// src/config/mod.rs
pub mod ai;
pub mod pipeline;

pub use pipeline::{load_pipeline_config, load_pipeline_config_from, PipelineConfig, SourceEntry};
