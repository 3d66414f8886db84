pub mod spine_pipeline;

pub use spine_pipeline::SpinePipeline;
