//! pipegraph - assemble executable pipelines from layered YAML blueprints

pub mod cli;
pub mod core;
pub mod service;

// Re-export commonly used types
pub use crate::core::blueprint::{Blueprint, MergeStrategy};
pub use crate::core::builder::{Pipeline, PipelineBuilder, SessionConfig, Tag};
pub use crate::core::error::{BlueprintError, BuilderError, ResolveError, ServiceError, StepError};
pub use crate::core::registry::FunctionRegistry;
pub use crate::core::step::{PipelineStep, StepKind, StepTable};
pub use crate::core::value::{Parameter, ParameterTable, ParameterType, PropertyFile, ResolvedValue};
pub use crate::service::{ExecutionStatus, LocalPipelineService, PipelineService};
