//! CLI command definitions

use clap::Args;

/// Create or update a pipeline from its blueprint
#[derive(Debug, Args, Clone)]
pub struct UpsertCommand {
    /// Pipeline name (the blueprint key holding its document)
    #[arg(short, long)]
    pub pipeline_name: String,

    /// Path to the root blueprint file
    #[arg(short, long, default_value = "blueprint.yaml")]
    pub blueprint: String,

    /// Context overrides for hierarchy interpolation (key=value)
    #[arg(long = "set", value_parser = parse_key_value)]
    pub context: Vec<(String, String)>,

    /// Render the definition without contacting the service
    #[arg(long)]
    pub dry_run: bool,

    /// Override the step parallelism limit
    #[arg(long)]
    pub max_parallel_execution_steps: Option<u32>,

    /// Keep custom job name prefixes in generated jobs
    #[arg(long)]
    pub use_custom_job_prefix: bool,

    /// Experiment name recorded with executions
    #[arg(long)]
    pub experiment_name: Option<String>,

    /// Trial name recorded with executions
    #[arg(long)]
    pub trial_name: Option<String>,
}

/// Upsert a pipeline and start an execution
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Pipeline name (the blueprint key holding its document)
    #[arg(short, long)]
    pub pipeline_name: String,

    /// Path to the root blueprint file
    #[arg(short, long, default_value = "blueprint.yaml")]
    pub blueprint: String,

    /// Context overrides for hierarchy interpolation (key=value)
    #[arg(long = "set", value_parser = parse_key_value)]
    pub context: Vec<(String, String)>,

    /// Parameter overrides for the execution (key=value)
    #[arg(long = "parameter", value_parser = parse_key_value)]
    pub parameters: Vec<(String, String)>,

    /// Poll the execution until it reaches a terminal state
    #[arg(long)]
    pub wait: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
