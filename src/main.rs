use anyhow::{Context, Result};
use pipegraph::cli::commands::{RunCommand, UpsertCommand};
use pipegraph::cli::output::{format_status, style, CHECK, CROSS, INFO, ROCKET, SPINNER};
use pipegraph::cli::{Cli, Command};
use pipegraph::core::blueprint::{Blueprint, MergeStrategy};
use pipegraph::core::builder::{PipelineBuilder, SessionConfig, Tag};
use pipegraph::service::{ExecutionStatus, LocalPipelineService, PipelineService};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Upsert(cmd) => upsert_pipeline(cmd).await?,
        Command::Run(cmd) => run_pipeline(cmd).await?,
    }

    Ok(())
}

/// Assemble a builder from the blueprint, ready to build
fn assemble(
    blueprint_path: &str,
    context: &[(String, String)],
    pipeline_name: &str,
) -> Result<PipelineBuilder> {
    let mut blueprint = Blueprint::load(blueprint_path)
        .with_context(|| format!("Failed to load blueprint from {blueprint_path}"))?;
    for (key, value) in context {
        blueprint.set_context(key, value);
    }

    let resources = blueprint
        .get_definition("resource_config")
        .context("Failed to look up resource_config")?;
    let document = blueprint
        .get_definition(pipeline_name)
        .with_context(|| format!("Failed to look up pipeline document '{pipeline_name}'"))?;

    let role = resources
        .get("execution_role")
        .and_then(Value::as_str)
        .context("execution_role missing from resource_config")?;
    let session = SessionConfig {
        default_bucket: blueprint
            .get("session_bucket", MergeStrategy::First, false)?
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string),
        region: resources
            .get("region")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let name = document
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(pipeline_name);
    debug!(pipeline = name, "assembling pipeline");

    let mut builder = PipelineBuilder::new()
        .set_name(name)
        .set_role_arn(role)
        .set_session(session)
        .add_security_group_ids(string_list(resources.get("security_group_ids")))
        .add_subnets(string_list(resources.get("subnets")));

    if let Some(parameters) = document.get("parameters") {
        builder = builder.add_parameters(parameters)?;
    }
    if let Some(files) = document.get("property_files") {
        builder = builder.add_property_files(files)?;
    }
    if let Some(config) = document.get("pipeline_experiment_config") {
        builder = builder.set_pipeline_experiment_config(config)?;
    }
    if let Some(max) = document
        .get("max_parallel_execution_steps")
        .and_then(Value::as_u64)
    {
        builder = builder.set_max_parallel_execution_steps(max as u32);
    }
    if let Some(prefix) = document.get("use_custom_job_prefix").and_then(Value::as_bool) {
        builder = builder.set_use_custom_job_prefix(prefix);
    }

    builder = builder.add_steps(&document)?;

    if let Some(tags) = blueprint.get("tags", MergeStrategy::First, false)? {
        let tags: Vec<Tag> = serde_yaml::from_value(tags).context("Failed to parse tags")?;
        builder = builder.add_tags(tags);
    }

    Ok(builder)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

async fn upsert_pipeline(cmd: &UpsertCommand) -> Result<()> {
    let mut builder = assemble(&cmd.blueprint, &cmd.context, &cmd.pipeline_name)?;

    // The blueprint document wins; flags only fill in unset settings
    if let Some(max) = cmd.max_parallel_execution_steps {
        builder = builder.set_max_parallel_execution_steps_default(max);
    }
    if cmd.use_custom_job_prefix {
        builder = builder.set_use_custom_job_prefix_default(true);
    }
    if cmd.experiment_name.is_some() || cmd.trial_name.is_some() {
        let mut section = serde_yaml::Mapping::new();
        if let Some(name) = &cmd.experiment_name {
            section.insert(
                Value::String("experiment_name".to_string()),
                Value::String(name.clone()),
            );
        }
        if let Some(trial) = &cmd.trial_name {
            section.insert(
                Value::String("trial_name".to_string()),
                Value::String(trial.clone()),
            );
        }
        builder = builder.set_pipeline_experiment_config(&Value::Mapping(section))?;
    }

    let builder = builder.build()?;

    if cmd.dry_run {
        println!(
            "{} Definition for {}:",
            INFO,
            style(&cmd.pipeline_name).bold()
        );
        println!("{}", serde_json::to_string_pretty(&builder.definition()?)?);
        return Ok(());
    }

    let service = LocalPipelineService::new();
    let summary = builder.upsert(&service).await?;
    println!(
        "{} Upserted {} ({})",
        CHECK,
        style(&summary.name).bold(),
        style(&summary.arn).dim()
    );

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    let builder = assemble(&cmd.blueprint, &cmd.context, &cmd.pipeline_name)?.build()?;

    let service = LocalPipelineService::new();
    let summary = builder.upsert(&service).await?;
    println!("{} Upserted {}", CHECK, style(&summary.name).bold());

    let parameters: BTreeMap<String, String> = cmd.parameters.iter().cloned().collect();
    let handle = builder.run(&service, parameters).await?;
    println!(
        "{} Started execution {}",
        ROCKET,
        style(&handle.execution_id).cyan()
    );

    if cmd.wait {
        loop {
            let description = service.describe_execution(&handle.execution_id).await?;
            println!("{} {}", SPINNER, format_status(description.status));
            if description.status.is_terminal() {
                if description.status == ExecutionStatus::Failed {
                    println!(
                        "{} Execution {} {}",
                        CROSS,
                        style(&handle.execution_id).dim(),
                        style("failed").red()
                    );
                    if let Some(reason) = description.failure_reason {
                        println!("  {}", style(reason).red());
                    }
                    std::process::exit(1);
                }
                break;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    Ok(())
}
