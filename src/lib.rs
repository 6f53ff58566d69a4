//! fastflow - File-Pattern Workflow Engine
//!
//! Declares a pipeline as a chain of tasks whose inputs and outputs are
//! described by filename patterns, expands it into a concrete graph of file
//! nodes, and reruns only the nodes whose outputs are out of date.
//!
//! # Architecture
//!
//! - [`pipeline`]: task definitions, pattern matching, graph expansion and
//!   staleness checks
//! - [`execution`]: scheduling, work unit execution and run reports
//! - [`error`]: error types shared by both
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fastflow::execution::{RunOptions, Scheduler, WorkUnitRunner};
//! use fastflow::pipeline::TaskGraphBuilder;
//! use fastflow::load_pipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let loaded = load_pipeline("pipeline.yaml")?;
//!
//!     let graph = TaskGraphBuilder::new(&loaded.def, &loaded.context)
//!         .with_registry(&loaded.registry)
//!         .build()?;
//!
//!     let runner = WorkUnitRunner::new(Arc::new(loaded.context), loaded.registry)
//!         .with_working_dir("/data/analysis");
//!
//!     let options = RunOptions {
//!         max_parallel: 4,
//!         ..RunOptions::default()
//!     };
//!     let report = Scheduler::new(graph, runner).with_options(options).run().await?;
//!     println!("{}", report.summary_line());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod pipeline;

// Re-export commonly used types
pub use error::{ConfigError, PipelineError, Result};
pub use execution::{RunOptions, RunReport, Scheduler, WorkUnitRunner};
pub use pipeline::{load_pipeline, PipelineContext, PipelineDef, TaskGraph, TaskSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "fastflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "fastflow");
    }

    #[test]
    fn test_module_exports_pipeline() {
        let mut def = PipelineDef::new("exports");
        def.add(TaskSpec::originate("inputs")).unwrap();
        assert_eq!(def.len(), 1);
        assert!(def.get("inputs").unwrap().is_originate());
    }

    #[test]
    fn test_module_exports_options() {
        let options = RunOptions::default();
        assert!(options.max_parallel >= 1);
        assert!(options.targets.is_empty());
    }
}
