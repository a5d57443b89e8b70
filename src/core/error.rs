//! Error taxonomy for blueprint resolution and pipeline assembly

use thiserror::Error;

/// Errors raised while loading or querying a blueprint
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("Blueprint validation failed: {0}")]
    Validation(String),

    #[error("Missing configuration key: {0}")]
    MissingKey(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised while resolving symbolic references
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Unknown execution variable: {0}")]
    UnknownExecutionVariable(String),

    #[error("Unknown property file: {0}")]
    UnknownPropertyFile(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Unknown factory function: {0}")]
    UnknownFunction(String),

    #[error("Unknown factory enum: {0}")]
    UnknownEnum(String),

    #[error("Unknown helper: {0}")]
    UnknownHelper(String),

    #[error("Helper '{helper}' does not support action '{action}'")]
    UnknownAction { helper: String, action: String },

    #[error("Invalid factory mapping: {0}")]
    InvalidFactory(String),
}

/// Errors raised while validating or building a single step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Ambiguous or unrecognized step type for '{step}': matched keys {matched:?}")]
    Discrimination { step: String, matched: Vec<String> },

    #[error("Invalid configuration for step '{step}': {reason}")]
    Validation { step: String, reason: String },

    #[error("Step build failed for step '{step}': {source}")]
    Build {
        step: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors raised by the pipeline builder
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("Pipeline definition not found for {0}")]
    PipelineNotFound(String),

    #[error("Duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("Expected a mapping for {0}")]
    ExpectedMapping(String),

    #[error("Invalid pipeline configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Errors raised by a pipeline execution service
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Pipeline not found: {0}")]
    NotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Service request failed: {0}")]
    Request(String),
}
