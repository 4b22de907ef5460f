//! The pipeline DAG: construction, validation, and next-runnable-service
//! resolution.

pub mod dag;
pub mod descriptor;
pub mod registry;

pub use dag::Pipeline;
pub use descriptor::ServiceDescriptor;
pub use registry::{build_pipeline, build_pipeline_with_broker};
