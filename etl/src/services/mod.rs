pub mod pipeline;

pub use pipeline::{Pipeline, PipelineReport};
