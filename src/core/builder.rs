//! Pipeline assembly
//!
//! `PipelineBuilder` accumulates parameters, property files, and steps from a
//! resolved blueprint document, then freezes them into a `Pipeline` with an
//! explicit `build()` call. Querying the definition or talking to an
//! execution service before `build()` fails with `PipelineNotFound`.

use crate::core::error::BuilderError;
use crate::core::registry::FunctionRegistry;
use crate::core::resolver::{resolve_tree, ResolutionEnv};
use crate::core::step::{Branches, BuildContext, PipelineStep, StepModel, StepTable};
use crate::core::value::{
    yaml_key_to_string, ExecutionVariable, ParameterTable, PropertyFile, ResolvedMap, ResolvedValue,
};
use crate::service::{ExecutionHandle, PipelineService, PipelineSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Document keys consumed by the builder itself; everything else in a
/// pipeline document is a step
pub const RESERVED_KEYS: &[&str] = &[
    "name",
    "parameters",
    "property_files",
    "max_parallel_execution_steps",
    "use_custom_job_prefix",
    "pipeline_experiment_config",
];

/// Wire version of the definition document
const DEFINITION_VERSION: &str = "2020-12-01";

/// Execution session settings shared by every built step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub default_bucket: Option<String>,
    pub region: Option<String>,
}

impl SessionConfig {
    pub fn to_resolved(&self) -> ResolvedValue {
        let mut map = ResolvedMap::new();
        if let Some(bucket) = &self.default_bucket {
            map.insert(
                "default_bucket".to_string(),
                ResolvedValue::String(bucket.clone()),
            );
        }
        if let Some(region) = &self.region {
            map.insert("region".to_string(), ResolvedValue::String(region.clone()));
        }
        ResolvedValue::Mapping(map)
    }
}

/// Resource tag attached to the pipeline on upsert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

/// Experiment and trial names recorded with every execution
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub experiment_name: ResolvedValue,
    pub trial_name: ResolvedValue,
}

impl Default for ExperimentConfig {
    /// Executions default to one experiment per pipeline, one trial per run
    fn default() -> Self {
        Self {
            experiment_name: ResolvedValue::ExecutionVariable(ExecutionVariable::PIPELINE_NAME),
            trial_name: ResolvedValue::ExecutionVariable(
                ExecutionVariable::PIPELINE_EXECUTION_ID,
            ),
        }
    }
}

impl ExperimentConfig {
    fn render(&self) -> serde_json::Value {
        serde_json::json!({
            "ExperimentName": self.experiment_name.render(),
            "TrialName": self.trial_name.render(),
        })
    }
}

/// A frozen, fully assembled pipeline
#[derive(Debug)]
pub struct Pipeline {
    pub name: String,
    pub parameters: ParameterTable,
    pub steps: Vec<PipelineStep>,
    pub experiment_config: ExperimentConfig,
    pub max_parallel_execution_steps: Option<u32>,
    pub use_custom_job_prefix: Option<bool>,
}

impl Pipeline {
    /// Render the definition document the execution service consumes
    pub fn definition(&self) -> serde_json::Value {
        let parameters: Vec<serde_json::Value> = self
            .parameters
            .iter()
            .map(|param| {
                let mut entry = serde_json::Map::new();
                entry.insert("Name".to_string(), serde_json::json!(param.name));
                entry.insert(
                    "Type".to_string(),
                    serde_json::json!(param.param_type.as_str()),
                );
                if let Some(default) = &param.default_value {
                    if let Ok(value) = serde_json::to_value(default) {
                        entry.insert("DefaultValue".to_string(), value);
                    }
                }
                serde_json::Value::Object(entry)
            })
            .collect();

        let mut definition = serde_json::Map::new();
        definition.insert(
            "Version".to_string(),
            serde_json::json!(DEFINITION_VERSION),
        );
        definition.insert("Metadata".to_string(), serde_json::json!({}));
        definition.insert(
            "Parameters".to_string(),
            serde_json::Value::Array(parameters),
        );
        definition.insert(
            "PipelineExperimentConfig".to_string(),
            self.experiment_config.render(),
        );
        if let Some(parallelism) = self.max_parallel_execution_steps {
            definition.insert(
                "ParallelismConfiguration".to_string(),
                serde_json::json!({ "MaxParallelExecutionSteps": parallelism }),
            );
        }
        if let Some(prefix) = self.use_custom_job_prefix {
            definition.insert(
                "PipelineDefinitionConfig".to_string(),
                serde_json::json!({ "UseCustomJobPrefix": prefix }),
            );
        }
        definition.insert(
            "Steps".to_string(),
            serde_json::Value::Array(self.steps.iter().map(|step| step.render()).collect()),
        );
        serde_json::Value::Object(definition)
    }
}

/// Builder accumulating the pieces of a pipeline definition
#[derive(Debug)]
pub struct PipelineBuilder {
    name: Option<String>,
    role_arn: Option<String>,
    session: SessionConfig,
    security_group_ids: Vec<String>,
    subnets: Vec<String>,
    parameters: ParameterTable,
    property_files: BTreeMap<String, PropertyFile>,
    steps: StepTable,
    tags: Vec<Tag>,
    experiment_config: ExperimentConfig,
    max_parallel_execution_steps: Option<u32>,
    use_custom_job_prefix: Option<bool>,
    registry: FunctionRegistry,
    pipeline: Option<Pipeline>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            role_arn: None,
            session: SessionConfig::default(),
            security_group_ids: Vec::new(),
            subnets: Vec::new(),
            parameters: ParameterTable::new(),
            property_files: BTreeMap::new(),
            steps: StepTable::new(),
            tags: Vec::new(),
            experiment_config: ExperimentConfig::default(),
            max_parallel_execution_steps: None,
            use_custom_job_prefix: None,
            registry: FunctionRegistry::new(),
            pipeline: None,
        }
    }

    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn set_role_arn(mut self, role_arn: impl Into<String>) -> Self {
        self.role_arn = Some(role_arn.into());
        self
    }

    pub fn set_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn add_security_group_ids(mut self, ids: Vec<String>) -> Self {
        self.security_group_ids.extend(ids);
        self
    }

    pub fn add_subnets(mut self, subnets: Vec<String>) -> Self {
        self.subnets.extend(subnets);
        self
    }

    pub fn add_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn add_tags(mut self, tags: Vec<Tag>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn set_max_parallel_execution_steps(mut self, max: u32) -> Self {
        self.max_parallel_execution_steps = Some(max);
        self
    }

    /// Fallback parallelism limit, applied only when the pipeline document
    /// did not set one
    pub fn set_max_parallel_execution_steps_default(mut self, max: u32) -> Self {
        self.max_parallel_execution_steps.get_or_insert(max);
        self
    }

    pub fn set_use_custom_job_prefix(mut self, enabled: bool) -> Self {
        self.use_custom_job_prefix = Some(enabled);
        self
    }

    /// Fallback prefix setting, applied only when the pipeline document did
    /// not set one
    pub fn set_use_custom_job_prefix_default(mut self, enabled: bool) -> Self {
        self.use_custom_job_prefix.get_or_insert(enabled);
        self
    }

    /// Register a single typed parameter
    pub fn add_parameter(
        mut self,
        name: &str,
        type_name: &str,
        default_value: Option<serde_yaml::Value>,
    ) -> Result<Self, BuilderError> {
        let parameter = self.registry.parameter(type_name, name, default_value)?;
        self.parameters.insert(parameter);
        Ok(self)
    }

    /// Register parameters from a document section shaped as
    /// `name: {type: parameters:<Type>, default: <value>}`
    pub fn add_parameters(mut self, section: &serde_yaml::Value) -> Result<Self, BuilderError> {
        let mapping = section
            .as_mapping()
            .ok_or_else(|| BuilderError::ExpectedMapping("parameters".to_string()))?;

        for (key, value) in mapping {
            let name = yaml_key_to_string(key);
            let entry = value
                .as_mapping()
                .ok_or_else(|| BuilderError::ExpectedMapping(format!("parameter `{name}`")))?;
            let type_name = entry
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    BuilderError::Validation(format!("parameter `{name}` is missing `type`"))
                })?
                .to_string();
            let default_value = entry.get("default").cloned();
            self = self.add_parameter(&name, &type_name, default_value)?;
        }
        Ok(self)
    }

    /// Register a single property file
    pub fn add_property_file(mut self, name: &str, output_name: &str, path: &str) -> Self {
        self.property_files.insert(
            name.to_string(),
            PropertyFile {
                name: name.to_string(),
                output_name: output_name.to_string(),
                path: path.to_string(),
            },
        );
        self
    }

    /// Register property files from a document section shaped as
    /// `name: {output_name: ..., path: ...}`
    pub fn add_property_files(mut self, section: &serde_yaml::Value) -> Result<Self, BuilderError> {
        let mapping = section
            .as_mapping()
            .ok_or_else(|| BuilderError::ExpectedMapping("property_files".to_string()))?;

        for (key, value) in mapping {
            let name = yaml_key_to_string(key);
            let entry = value
                .as_mapping()
                .ok_or_else(|| BuilderError::ExpectedMapping(format!("property file `{name}`")))?;
            let output_name = entry
                .get("output_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    BuilderError::Validation(format!(
                        "property file `{name}` is missing `output_name`"
                    ))
                })?;
            let path = entry.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
                BuilderError::Validation(format!("property file `{name}` is missing `path`"))
            })?;
            self = self.add_property_file(&name, output_name, path);
        }
        Ok(self)
    }

    /// Experiment and trial names, each resolvable (`exec:` tokens allowed)
    pub fn set_pipeline_experiment_config(
        mut self,
        section: &serde_yaml::Value,
    ) -> Result<Self, BuilderError> {
        let mapping = section.as_mapping().ok_or_else(|| {
            BuilderError::ExpectedMapping("pipeline_experiment_config".to_string())
        })?;

        let mut config = ExperimentConfig::default();
        if let Some(name) = mapping.get("experiment_name") {
            config.experiment_name = resolve_tree(name, &self.env())?;
        }
        if let Some(trial) = mapping.get("trial_name") {
            config.trial_name = resolve_tree(trial, &self.env())?;
        }
        self.experiment_config = config;
        Ok(self)
    }

    fn env(&self) -> ResolutionEnv<'_> {
        ResolutionEnv {
            parameters: &self.parameters,
            property_files: &self.property_files,
            steps: &self.steps,
            registry: &self.registry,
        }
    }

    /// Resolve, validate, and build a single step, then insert it into the
    /// live step table
    pub fn add_step(mut self, name: &str, config: &serde_yaml::Value) -> Result<Self, BuilderError> {
        let resolved = resolve_tree(config, &self.env())?;
        let mut kwargs = match resolved {
            ResolvedValue::Mapping(map) => map,
            _ => return Err(BuilderError::ExpectedMapping(format!("step `{name}`"))),
        };

        // Branch steps are consumed out of the live table; afterwards they
        // can no longer be referenced by name.
        let branches = Branches {
            if_steps: self.take_branch(&mut kwargs, "if_steps", name)?,
            else_steps: self.take_branch(&mut kwargs, "else_steps", name)?,
        };

        let model = StepModel::validate(name, kwargs, branches)?;
        let step = {
            let ctx = BuildContext {
                role: self.role_arn.as_deref().unwrap_or(""),
                session: &self.session,
                security_group_ids: &self.security_group_ids,
                subnets: &self.subnets,
                registry: &self.registry,
            };
            model.build(&ctx)?
        };
        self.steps.insert(step)?;
        Ok(self)
    }

    /// Add every step of a pipeline document, in document order, skipping
    /// the reserved builder keys
    pub fn add_steps(mut self, document: &serde_yaml::Value) -> Result<Self, BuilderError> {
        let mapping = document
            .as_mapping()
            .ok_or_else(|| BuilderError::ExpectedMapping("pipeline document".to_string()))?;

        for (key, value) in mapping {
            let name = yaml_key_to_string(key);
            if RESERVED_KEYS.contains(&name.as_str()) {
                continue;
            }
            self = self.add_step(&name, value)?;
        }
        Ok(self)
    }

    fn take_branch(
        &mut self,
        kwargs: &mut ResolvedMap,
        key: &str,
        step: &str,
    ) -> Result<Vec<PipelineStep>, BuilderError> {
        let Some(value) = kwargs.remove(key) else {
            return Ok(Vec::new());
        };
        let names = match value {
            ResolvedValue::Sequence(seq) => seq,
            _ => {
                return Err(BuilderError::Validation(format!(
                    "`{key}` of step `{step}` must be a list of step names"
                )))
            }
        };

        let mut taken = Vec::with_capacity(names.len());
        for element in names {
            let name = element.as_str().ok_or_else(|| {
                BuilderError::Validation(format!(
                    "`{key}` of step `{step}` must be a list of step names"
                ))
            })?;
            let step = self
                .steps
                .take(name)
                .ok_or_else(|| crate::core::error::ResolveError::UnknownStep(name.to_string()))?;
            taken.push(step);
        }
        Ok(taken)
    }

    /// Freeze the accumulated state into a pipeline
    pub fn build(mut self) -> Result<Self, BuilderError> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| BuilderError::Validation("pipeline name is not set".to_string()))?;

        self.pipeline = Some(Pipeline {
            name,
            parameters: std::mem::take(&mut self.parameters),
            steps: std::mem::take(&mut self.steps).into_steps(),
            experiment_config: self.experiment_config.clone(),
            max_parallel_execution_steps: self.max_parallel_execution_steps,
            use_custom_job_prefix: self.use_custom_job_prefix,
        });
        Ok(self)
    }

    fn pipeline(&self) -> Result<&Pipeline, BuilderError> {
        self.pipeline.as_ref().ok_or_else(|| {
            BuilderError::PipelineNotFound(self.name.clone().unwrap_or_default())
        })
    }

    /// Rendered definition of the built pipeline
    pub fn definition(&self) -> Result<serde_json::Value, BuilderError> {
        Ok(self.pipeline()?.definition())
    }

    /// Create or update the pipeline on the execution service
    pub async fn upsert(
        &self,
        service: &dyn PipelineService,
    ) -> Result<PipelineSummary, BuilderError> {
        let pipeline = self.pipeline()?;
        let summary = service
            .upsert(&pipeline.name, pipeline.definition(), &self.tags)
            .await?;
        Ok(summary)
    }

    /// Start an execution of the built pipeline
    pub async fn run(
        &self,
        service: &dyn PipelineService,
        parameters: BTreeMap<String, String>,
    ) -> Result<ExecutionHandle, BuilderError> {
        let pipeline = self.pipeline()?;
        let handle = service.start(&pipeline.name, parameters).await?;
        Ok(handle)
    }
}
