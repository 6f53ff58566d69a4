//! Pipeline Definition
//!
//! Everything needed to go from declarations and input files to a task graph
//! with staleness decisions:
//! - `pattern`: full-path patterns, captures and templates
//! - `model`: task declarations and the ordered pipeline definition
//! - `context`: read-only input files and options
//! - `stage`: work unit construction per task
//! - `graph`: expansion into concrete nodes and edges
//! - `staleness`: which nodes must run
//! - `config`: YAML pipeline files

pub mod config;
pub mod context;
pub mod graph;
pub mod model;
pub mod pattern;
pub mod staleness;
pub mod stage;

pub use config::{load_pipeline, LoadedPipeline, PipelineConfig};
pub use context::{PipelineContext, StageSettings};
pub use graph::{NodeId, TaskGraph, TaskGraphBuilder, TaskNode};
pub use model::{PipelineDef, TaskKind, TaskSpec};
pub use pattern::{Binding, MatchOutcome, Pattern, Template};
pub use staleness::{Freshness, StalenessChecker, StalenessPlan};
pub use stage::{ShellCommand, ShellStage, Stage, StageRegistry, WorkUnit};
