//! Discriminated step assembly
//!
//! A raw step configuration selects exactly one variant of a closed set,
//! keyed by a variant-specific discriminator key. Each variant validates its
//! own structural contract, then builds the step the execution service runs,
//! optionally constructing a helper object (processor, estimator, model,
//! transformer, tuner) and invoking one of its action methods.

use crate::core::builder::SessionConfig;
use crate::core::error::{BuilderError, ResolveError, StepError};
use crate::core::registry::{FunctionRegistry, StepArguments};
use crate::core::value::{Constructed, PropertyFile, ResolvedMap, ResolvedValue};

/// Step variants supported by the execution service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    AutoMl,
    Callback,
    Check,
    Condition,
    Emr,
    Fail,
    Lambda,
    Model,
    NotebookJob,
    Processing,
    Training,
    Transform,
    Tuning,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::AutoMl => "AutoML",
            StepKind::Callback => "Callback",
            StepKind::Check => "Check",
            StepKind::Condition => "Condition",
            StepKind::Emr => "EMR",
            StepKind::Fail => "Fail",
            StepKind::Lambda => "Lambda",
            StepKind::Model => "Model",
            StepKind::NotebookJob => "NotebookJob",
            StepKind::Processing => "Processing",
            StepKind::Training => "Training",
            StepKind::Transform => "Transform",
            StepKind::Tuning => "Tuning",
        }
    }
}

/// Discriminator keys, one per variant
const DISCRIMINATORS: &[(&str, StepKind)] = &[
    ("automl_kwargs", StepKind::AutoMl),
    ("sqs_queue_url", StepKind::Callback),
    ("check_job_config_kwargs", StepKind::Check),
    ("conditions", StepKind::Condition),
    ("emr_step_config_kwargs", StepKind::Emr),
    ("error_message", StepKind::Fail),
    ("lambda_func_kwargs", StepKind::Lambda),
    ("model_kwargs", StepKind::Model),
    ("notebook_job_kwargs", StepKind::NotebookJob),
    ("processor_kwargs", StepKind::Processing),
    ("estimator_kwargs", StepKind::Training),
    ("transformer_kwargs", StepKind::Transform),
    ("tuner_kwargs", StepKind::Tuning),
];

/// Select the step variant from the configuration's top-level key set.
///
/// Exactly one discriminator key must match. The one sanctioned exception:
/// a tuning step layers `tuner_kwargs` on top of a training configuration,
/// so the pair {`estimator_kwargs`, `tuner_kwargs`} selects Tuning.
pub fn discriminate(step: &str, kwargs: &ResolvedMap) -> Result<StepKind, StepError> {
    let mut matched: Vec<(&str, StepKind)> = DISCRIMINATORS
        .iter()
        .filter(|(key, _)| kwargs.contains_key(*key))
        .copied()
        .collect();

    match matched.len() {
        1 => Ok(matched[0].1),
        2 if matched.iter().any(|(key, _)| *key == "estimator_kwargs")
            && matched.iter().any(|(key, _)| *key == "tuner_kwargs") =>
        {
            Ok(StepKind::Tuning)
        }
        _ => {
            matched.sort_by_key(|(key, _)| *key);
            Err(StepError::Discrimination {
                step: step.to_string(),
                matched: matched.iter().map(|(key, _)| key.to_string()).collect(),
            })
        }
    }
}

/// Context every step build receives: role, session, and network settings
/// resolved by the surrounding command handler
pub struct BuildContext<'a> {
    pub role: &'a str,
    pub session: &'a SessionConfig,
    pub security_group_ids: &'a [String],
    pub subnets: &'a [String],
    pub registry: &'a FunctionRegistry,
}

impl BuildContext<'_> {
    fn role_value(&self) -> ResolvedValue {
        ResolvedValue::String(self.role.to_string())
    }

    fn string_list(values: &[String]) -> ResolvedValue {
        ResolvedValue::Sequence(
            values
                .iter()
                .map(|v| ResolvedValue::String(v.clone()))
                .collect(),
        )
    }

    /// `{SecurityGroupIds: [...], Subnets: [...]}` for vpc-style helpers
    fn vpc_config(&self) -> ResolvedValue {
        let mut map = ResolvedMap::new();
        map.insert(
            "SecurityGroupIds".to_string(),
            Self::string_list(self.security_group_ids),
        );
        map.insert("Subnets".to_string(), Self::string_list(self.subnets));
        ResolvedValue::Mapping(map)
    }

    /// `{security_group_ids: [...], subnets: [...]}` for network-config helpers
    fn network_config(&self) -> ResolvedValue {
        let mut map = ResolvedMap::new();
        map.insert(
            "security_group_ids".to_string(),
            Self::string_list(self.security_group_ids),
        );
        map.insert("subnets".to_string(), Self::string_list(self.subnets));
        ResolvedValue::Mapping(map)
    }
}

/// A built pipeline step; owned by the step table until consumed into a
/// condition branch
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub name: String,
    pub kind: StepKind,
    pub step_args: Option<StepArguments>,
    pub depends_on: Vec<String>,
    pub cache_config: Option<ResolvedValue>,
    pub retry_policies: Option<ResolvedValue>,
    pub property_files: Vec<PropertyFile>,
    pub conditions: Vec<ResolvedValue>,
    pub if_steps: Vec<PipelineStep>,
    pub else_steps: Vec<PipelineStep>,
    /// Variant-specific fields plus pass-through extras
    pub fields: ResolvedMap,
}

impl PipelineStep {
    fn new(name: String, kind: StepKind, common: StepCommon) -> Self {
        Self {
            name,
            kind,
            step_args: None,
            depends_on: common.depends_on,
            cache_config: common.cache_config,
            retry_policies: common.retry_policies,
            property_files: Vec::new(),
            conditions: Vec::new(),
            if_steps: Vec::new(),
            else_steps: Vec::new(),
            fields: common.extra,
        }
    }

    /// Render to the JSON shape used in the pipeline definition
    pub fn render(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("Name".to_string(), serde_json::json!(self.name));
        out.insert("Type".to_string(), serde_json::json!(self.kind.as_str()));

        if let Some(args) = &self.step_args {
            out.insert("Arguments".to_string(), args.render());
        }
        if !self.depends_on.is_empty() {
            out.insert("DependsOn".to_string(), serde_json::json!(self.depends_on));
        }
        if let Some(cache) = &self.cache_config {
            out.insert("CacheConfig".to_string(), cache.render());
        }
        if let Some(retry) = &self.retry_policies {
            out.insert("RetryPolicies".to_string(), retry.render());
        }
        if !self.property_files.is_empty() {
            let files: Vec<serde_json::Value> = self
                .property_files
                .iter()
                .map(|pf| ResolvedValue::PropertyFile(pf.clone()).render())
                .collect();
            out.insert("PropertyFiles".to_string(), serde_json::Value::Array(files));
        }
        if self.kind == StepKind::Condition {
            out.insert(
                "Conditions".to_string(),
                serde_json::Value::Array(self.conditions.iter().map(|c| c.render()).collect()),
            );
            out.insert(
                "IfSteps".to_string(),
                serde_json::Value::Array(self.if_steps.iter().map(|s| s.render()).collect()),
            );
            out.insert(
                "ElseSteps".to_string(),
                serde_json::Value::Array(self.else_steps.iter().map(|s| s.render()).collect()),
            );
        }
        for (key, value) in &self.fields {
            out.insert(key.clone(), value.render());
        }

        serde_json::Value::Object(out)
    }
}

/// Live table of built steps, insertion ordered
///
/// `take` has explicit remove-and-return semantics: a step consumed into a
/// condition branch can no longer be referenced by name.
#[derive(Debug, Default)]
pub struct StepTable {
    entries: Vec<PipelineStep>,
}

impl StepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PipelineStep> {
        self.entries.iter().find(|step| step.name == name)
    }

    pub fn insert(&mut self, step: PipelineStep) -> Result<(), BuilderError> {
        if self.get(&step.name).is_some() {
            return Err(BuilderError::DuplicateStep(step.name));
        }
        self.entries.push(step);
        Ok(())
    }

    /// Remove and return the named step, transferring ownership to the caller
    pub fn take(&mut self, name: &str) -> Option<PipelineStep> {
        let index = self.entries.iter().position(|step| step.name == name)?;
        Some(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn into_steps(self) -> Vec<PipelineStep> {
        self.entries
    }
}

/// Branch steps already taken from the step table by the assembler
#[derive(Debug, Default)]
pub struct Branches {
    pub if_steps: Vec<PipelineStep>,
    pub else_steps: Vec<PipelineStep>,
}

/// Fields shared by every step variant
#[derive(Debug)]
struct StepCommon {
    depends_on: Vec<String>,
    cache_config: Option<ResolvedValue>,
    retry_policies: Option<ResolvedValue>,
    extra: ResolvedMap,
}

/// A validated step model, ready to build
#[derive(Debug)]
pub struct StepModel {
    name: String,
    variant: StepVariant,
}

#[derive(Debug)]
enum StepVariant {
    AutoMl(AutoMlStep),
    Callback(CallbackStep),
    Check(CheckStep),
    Condition(ConditionStep),
    Emr(EmrStep),
    Fail(FailStep),
    Lambda(LambdaStep),
    Model(ModelStep),
    NotebookJob(NotebookJobStep),
    Processing(ProcessingStep),
    Training(TrainingStep),
    Transform(TransformStep),
    Tuning(TuningStep),
}

#[derive(Debug)]
struct AutoMlStep {
    automl: String,
    automl_kwargs: ResolvedMap,
    fit_kwargs: ResolvedMap,
    common: StepCommon,
}

#[derive(Debug)]
struct CallbackStep {
    sqs_queue_url: ResolvedValue,
    inputs: ResolvedMap,
    outputs: Vec<ResolvedValue>,
    common: StepCommon,
}

#[derive(Debug)]
struct CheckStep {
    check_job_config_kwargs: ResolvedMap,
    clarify_check_config: Option<ResolvedValue>,
    quality_check_config: Option<ResolvedValue>,
    common: StepCommon,
}

#[derive(Debug)]
struct ConditionStep {
    conditions: Vec<ResolvedValue>,
    branches: Branches,
    common: StepCommon,
}

#[derive(Debug)]
struct EmrStep {
    emr_step_config_kwargs: ResolvedMap,
    cluster_id: Option<ResolvedValue>,
    cluster_config: Option<ResolvedValue>,
    execution_role_arn: Option<String>,
    display_name: String,
    description: String,
    common: StepCommon,
}

#[derive(Debug)]
struct FailStep {
    error_message: ResolvedValue,
    common: StepCommon,
}

#[derive(Debug)]
struct LambdaStep {
    lambda_func: String,
    lambda_func_kwargs: ResolvedMap,
    inputs: Option<ResolvedMap>,
    outputs: Option<Vec<ResolvedValue>>,
    common: StepCommon,
}

#[derive(Debug)]
struct ModelStep {
    model: String,
    model_kwargs: ResolvedMap,
    create_model_kwargs: Option<ResolvedMap>,
    register_model_kwargs: Option<ResolvedMap>,
    common: StepCommon,
}

#[derive(Debug)]
struct NotebookJobStep {
    notebook_job_kwargs: ResolvedMap,
    common: StepCommon,
}

#[derive(Debug)]
struct ProcessingStep {
    processor: String,
    processor_kwargs: ResolvedMap,
    step_kwargs: ResolvedMap,
    property_files: Vec<PropertyFile>,
    common: StepCommon,
}

#[derive(Debug)]
struct TrainingStep {
    estimator: String,
    estimator_kwargs: ResolvedMap,
    fit_kwargs: ResolvedMap,
    common: StepCommon,
}

#[derive(Debug)]
struct TransformStep {
    transformer: String,
    transformer_kwargs: ResolvedMap,
    step_kwargs: ResolvedMap,
    common: StepCommon,
}

#[derive(Debug)]
struct TuningStep {
    estimator: String,
    estimator_kwargs: ResolvedMap,
    tuner: String,
    tuner_kwargs: ResolvedMap,
    fit_kwargs: ResolvedMap,
    common: StepCommon,
}

impl StepModel {
    /// Discriminate and validate a resolved step configuration.
    ///
    /// Structural errors (missing fields, violated mutually-exclusive option
    /// groups) surface here, before any build is attempted.
    pub fn validate(
        name: &str,
        mut kwargs: ResolvedMap,
        branches: Branches,
    ) -> Result<Self, StepError> {
        let kind = discriminate(name, &kwargs)?;

        // A `name` entry in the configuration overrides the step key
        let name = match take_opt_string(&mut kwargs, "name", name)? {
            Some(explicit) => explicit,
            None => name.to_string(),
        };

        let variant = match kind {
            StepKind::AutoMl => StepVariant::AutoMl(AutoMlStep {
                automl: take_opt_string(&mut kwargs, "automl", &name)?
                    .unwrap_or_else(|| "automl:AutoML".to_string()),
                automl_kwargs: take_map(&mut kwargs, "automl_kwargs", &name)?,
                fit_kwargs: take_map(&mut kwargs, "fit_kwargs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Callback => StepVariant::Callback(CallbackStep {
                sqs_queue_url: take_value(&mut kwargs, "sqs_queue_url", &name)?,
                inputs: take_map(&mut kwargs, "inputs", &name)?,
                outputs: take_sequence(&mut kwargs, "outputs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Check => {
                let model = CheckStep {
                    check_job_config_kwargs: take_map(&mut kwargs, "check_job_config_kwargs", &name)?,
                    clarify_check_config: kwargs.remove("clarify_check_config"),
                    quality_check_config: kwargs.remove("quality_check_config"),
                    common: take_common(&mut kwargs, &name)?,
                };
                if model.clarify_check_config.is_some() == model.quality_check_config.is_some() {
                    return Err(StepError::Validation {
                        step: name,
                        reason: "either specify `clarify_check_config` or `quality_check_config`"
                            .to_string(),
                    });
                }
                StepVariant::Check(model)
            }
            StepKind::Condition => StepVariant::Condition(ConditionStep {
                conditions: take_sequence(&mut kwargs, "conditions", &name)?,
                branches,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Emr => {
                let model = EmrStep {
                    emr_step_config_kwargs: take_map(&mut kwargs, "emr_step_config_kwargs", &name)?,
                    cluster_id: kwargs.remove("cluster_id"),
                    cluster_config: kwargs.remove("cluster_config"),
                    execution_role_arn: take_opt_string(&mut kwargs, "execution_role_arn", &name)?,
                    display_name: take_string(&mut kwargs, "display_name", &name)?,
                    description: take_string(&mut kwargs, "description", &name)?,
                    common: take_common(&mut kwargs, &name)?,
                };
                if model.cluster_id.is_some() == model.cluster_config.is_some() {
                    return Err(StepError::Validation {
                        step: name,
                        reason: "either specify `cluster_id` or `cluster_config`".to_string(),
                    });
                }
                StepVariant::Emr(model)
            }
            StepKind::Fail => StepVariant::Fail(FailStep {
                error_message: take_value(&mut kwargs, "error_message", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Lambda => StepVariant::Lambda(LambdaStep {
                lambda_func: take_opt_string(&mut kwargs, "lambda_func", &name)?
                    .unwrap_or_else(|| "lambda:Lambda".to_string()),
                lambda_func_kwargs: take_map(&mut kwargs, "lambda_func_kwargs", &name)?,
                inputs: take_opt_map(&mut kwargs, "inputs", &name)?,
                outputs: take_opt_sequence(&mut kwargs, "outputs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Model => {
                let model = ModelStep {
                    model: take_opt_string(&mut kwargs, "model", &name)?
                        .unwrap_or_else(|| "model:Model".to_string()),
                    model_kwargs: take_map(&mut kwargs, "model_kwargs", &name)?,
                    create_model_kwargs: take_opt_map(&mut kwargs, "create_model_kwargs", &name)?,
                    register_model_kwargs: take_opt_map(&mut kwargs, "register_model_kwargs", &name)?,
                    common: take_common(&mut kwargs, &name)?,
                };
                if model.create_model_kwargs.is_some() == model.register_model_kwargs.is_some() {
                    return Err(StepError::Validation {
                        step: name,
                        reason: "either specify `create_model_kwargs` or `register_model_kwargs`"
                            .to_string(),
                    });
                }
                StepVariant::Model(model)
            }
            StepKind::NotebookJob => StepVariant::NotebookJob(NotebookJobStep {
                notebook_job_kwargs: take_map(&mut kwargs, "notebook_job_kwargs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Processing => StepVariant::Processing(ProcessingStep {
                processor: take_opt_string(&mut kwargs, "processor", &name)?
                    .unwrap_or_else(|| "processing:Processor".to_string()),
                processor_kwargs: take_map(&mut kwargs, "processor_kwargs", &name)?,
                step_kwargs: take_map(&mut kwargs, "step_kwargs", &name)?,
                property_files: take_property_files(&mut kwargs, &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Training => StepVariant::Training(TrainingStep {
                estimator: take_opt_string(&mut kwargs, "estimator", &name)?
                    .unwrap_or_else(|| "estimator:Estimator".to_string()),
                estimator_kwargs: take_map(&mut kwargs, "estimator_kwargs", &name)?,
                fit_kwargs: take_map(&mut kwargs, "fit_kwargs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Transform => StepVariant::Transform(TransformStep {
                transformer: take_opt_string(&mut kwargs, "transformer", &name)?
                    .unwrap_or_else(|| "transformer:Transformer".to_string()),
                transformer_kwargs: take_map(&mut kwargs, "transformer_kwargs", &name)?,
                step_kwargs: take_map(&mut kwargs, "step_kwargs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
            StepKind::Tuning => StepVariant::Tuning(TuningStep {
                estimator: take_opt_string(&mut kwargs, "estimator", &name)?
                    .unwrap_or_else(|| "estimator:Estimator".to_string()),
                estimator_kwargs: take_map(&mut kwargs, "estimator_kwargs", &name)?,
                tuner: take_opt_string(&mut kwargs, "tuner", &name)?
                    .unwrap_or_else(|| "tuner:HyperparameterTuner".to_string()),
                tuner_kwargs: take_map(&mut kwargs, "tuner_kwargs", &name)?,
                fit_kwargs: take_map(&mut kwargs, "fit_kwargs", &name)?,
                common: take_common(&mut kwargs, &name)?,
            }),
        };

        Ok(StepModel {
            name,
            variant,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build the step; any failure is wrapped with the step name, preserving
    /// the original cause
    pub fn build(self, ctx: &BuildContext) -> Result<PipelineStep, StepError> {
        let name = self.name.clone();
        self.build_inner(ctx).map_err(|source| StepError::Build {
            step: name,
            source: Box::new(source),
        })
    }

    fn build_inner(self, ctx: &BuildContext) -> Result<PipelineStep, ResolveError> {
        let name = self.name;
        match self.variant {
            StepVariant::AutoMl(model) => {
                let mut config = model.automl_kwargs;
                config.insert("role".to_string(), ctx.role_value());
                config.insert("session".to_string(), ctx.session.to_resolved());
                config.insert("vpc_config".to_string(), ctx.vpc_config());
                let helper = ctx.registry.helper(&model.automl)?.construct(config);

                let mut step = PipelineStep::new(name, StepKind::AutoMl, model.common);
                step.step_args = Some(helper.invoke("fit", model.fit_kwargs)?);
                Ok(step)
            }
            StepVariant::Callback(model) => {
                let mut step = PipelineStep::new(name, StepKind::Callback, model.common);
                step.fields
                    .insert("SqsQueueUrl".to_string(), model.sqs_queue_url);
                step.fields
                    .insert("Inputs".to_string(), ResolvedValue::Mapping(model.inputs));
                step.fields.insert(
                    "Outputs".to_string(),
                    ResolvedValue::Sequence(model.outputs),
                );
                Ok(step)
            }
            StepVariant::Check(model) => {
                let mut job_config = model.check_job_config_kwargs;
                job_config.insert("role".to_string(), ctx.role_value());
                job_config.insert("session".to_string(), ctx.session.to_resolved());
                job_config.insert("network_config".to_string(), ctx.network_config());

                let mut step = PipelineStep::new(name, StepKind::Check, model.common);
                step.fields.insert(
                    "CheckJobConfig".to_string(),
                    ResolvedValue::Mapping(job_config),
                );
                if let Some(clarify) = model.clarify_check_config {
                    step.fields.insert("ClarifyCheckConfig".to_string(), clarify);
                }
                if let Some(quality) = model.quality_check_config {
                    step.fields.insert("QualityCheckConfig".to_string(), quality);
                }
                Ok(step)
            }
            StepVariant::Condition(model) => {
                let mut step = PipelineStep::new(name, StepKind::Condition, model.common);
                step.conditions = model.conditions;
                step.if_steps = model.branches.if_steps;
                step.else_steps = model.branches.else_steps;
                Ok(step)
            }
            StepVariant::Emr(model) => {
                let mut step = PipelineStep::new(name, StepKind::Emr, model.common);
                step.fields.insert(
                    "StepConfig".to_string(),
                    ResolvedValue::Mapping(model.emr_step_config_kwargs),
                );
                if let Some(cluster_id) = model.cluster_id {
                    // Running on an existing cluster defaults to the
                    // pipeline execution role
                    let role = model
                        .execution_role_arn
                        .unwrap_or_else(|| ctx.role.to_string());
                    step.fields.insert("ClusterId".to_string(), cluster_id);
                    step.fields
                        .insert("ExecutionRoleArn".to_string(), ResolvedValue::String(role));
                }
                if let Some(cluster_config) = model.cluster_config {
                    step.fields.insert("ClusterConfig".to_string(), cluster_config);
                }
                step.fields.insert(
                    "DisplayName".to_string(),
                    ResolvedValue::String(model.display_name),
                );
                step.fields.insert(
                    "Description".to_string(),
                    ResolvedValue::String(model.description),
                );
                Ok(step)
            }
            StepVariant::Fail(model) => {
                let mut step = PipelineStep::new(name, StepKind::Fail, model.common);
                step.fields
                    .insert("ErrorMessage".to_string(), model.error_message);
                Ok(step)
            }
            StepVariant::Lambda(model) => {
                let mut config = model.lambda_func_kwargs;
                config
                    .entry("execution_role_arn".to_string())
                    .or_insert_with(|| ctx.role_value());
                config.insert("session".to_string(), ctx.session.to_resolved());
                config.insert("vpc_config".to_string(), ctx.vpc_config());
                // Validates the function name against the closed helper set
                let helper = ctx.registry.helper(&model.lambda_func)?.construct(config);

                let mut step = PipelineStep::new(name, StepKind::Lambda, model.common);
                step.fields.insert(
                    "LambdaFunc".to_string(),
                    ResolvedValue::Object(Constructed {
                        type_name: helper.type_name.clone(),
                        kwargs: helper.config.clone(),
                    }),
                );
                if let Some(inputs) = model.inputs {
                    step.fields
                        .insert("Inputs".to_string(), ResolvedValue::Mapping(inputs));
                }
                if let Some(outputs) = model.outputs {
                    step.fields
                        .insert("Outputs".to_string(), ResolvedValue::Sequence(outputs));
                }
                Ok(step)
            }
            StepVariant::Model(model) => {
                let mut config = model.model_kwargs;
                config.insert("role".to_string(), ctx.role_value());
                config.insert("session".to_string(), ctx.session.to_resolved());
                config.insert("vpc_config".to_string(), ctx.vpc_config());
                let helper = ctx.registry.helper(&model.model)?.construct(config);

                let step_args = if let Some(create) = model.create_model_kwargs {
                    helper.invoke("create", create)?
                } else if let Some(register) = model.register_model_kwargs {
                    helper.invoke("register", register)?
                } else {
                    return Err(ResolveError::InvalidFactory(
                        "model step arguments cannot be instantiated".to_string(),
                    ));
                };

                let mut step = PipelineStep::new(name, StepKind::Model, model.common);
                step.step_args = Some(step_args);
                Ok(step)
            }
            StepVariant::NotebookJob(model) => {
                let mut step = PipelineStep::new(name, StepKind::NotebookJob, model.common);
                step.fields.insert(
                    "NotebookJobConfig".to_string(),
                    ResolvedValue::Mapping(model.notebook_job_kwargs),
                );
                step.fields.insert("Role".to_string(), ctx.role_value());
                step.fields.insert(
                    "SecurityGroupIds".to_string(),
                    BuildContext::string_list(ctx.security_group_ids),
                );
                step.fields
                    .insert("Subnets".to_string(), BuildContext::string_list(ctx.subnets));
                Ok(step)
            }
            StepVariant::Processing(model) => {
                let mut config = model.processor_kwargs;
                config.insert("role".to_string(), ctx.role_value());
                config.insert("session".to_string(), ctx.session.to_resolved());
                config.insert("network_config".to_string(), ctx.network_config());
                let helper = ctx.registry.helper(&model.processor)?.construct(config);

                let mut step = PipelineStep::new(name, StepKind::Processing, model.common);
                step.step_args = Some(helper.invoke("run", model.step_kwargs)?);
                step.property_files = model.property_files;
                Ok(step)
            }
            StepVariant::Training(model) => {
                let mut config = model.estimator_kwargs;
                config.insert("role".to_string(), ctx.role_value());
                config.insert("session".to_string(), ctx.session.to_resolved());
                config.insert(
                    "security_group_ids".to_string(),
                    BuildContext::string_list(ctx.security_group_ids),
                );
                config.insert("subnets".to_string(), BuildContext::string_list(ctx.subnets));
                let helper = ctx.registry.helper(&model.estimator)?.construct(config);

                let mut step = PipelineStep::new(name, StepKind::Training, model.common);
                step.step_args = Some(helper.invoke("fit", model.fit_kwargs)?);
                Ok(step)
            }
            StepVariant::Transform(model) => {
                let mut config = model.transformer_kwargs;
                config.insert("session".to_string(), ctx.session.to_resolved());
                let helper = ctx.registry.helper(&model.transformer)?.construct(config);

                let mut step = PipelineStep::new(name, StepKind::Transform, model.common);
                step.step_args = Some(helper.invoke("transform", model.step_kwargs)?);
                Ok(step)
            }
            StepVariant::Tuning(model) => {
                let mut estimator_config = model.estimator_kwargs;
                estimator_config.insert("role".to_string(), ctx.role_value());
                estimator_config.insert("session".to_string(), ctx.session.to_resolved());
                estimator_config.insert(
                    "security_group_ids".to_string(),
                    BuildContext::string_list(ctx.security_group_ids),
                );
                estimator_config
                    .insert("subnets".to_string(), BuildContext::string_list(ctx.subnets));
                let estimator = ctx
                    .registry
                    .helper(&model.estimator)?
                    .construct(estimator_config);

                let mut tuner_config = model.tuner_kwargs;
                tuner_config.insert(
                    "estimator".to_string(),
                    ResolvedValue::Object(Constructed {
                        type_name: estimator.type_name.clone(),
                        kwargs: estimator.config.clone(),
                    }),
                );
                let tuner = ctx.registry.helper(&model.tuner)?.construct(tuner_config);

                let mut step = PipelineStep::new(name, StepKind::Tuning, model.common);
                step.step_args = Some(tuner.invoke("fit", model.fit_kwargs)?);
                Ok(step)
            }
        }
    }
}

fn take_common(kwargs: &mut ResolvedMap, step: &str) -> Result<StepCommon, StepError> {
    let depends_on = match kwargs.remove("depends_on") {
        None => Vec::new(),
        Some(ResolvedValue::Sequence(seq)) => {
            let mut names = Vec::with_capacity(seq.len());
            for element in seq {
                match element {
                    ResolvedValue::String(s) => names.push(s),
                    _ => {
                        return Err(StepError::Validation {
                            step: step.to_string(),
                            reason: "depends_on entries must be step names".to_string(),
                        })
                    }
                }
            }
            names
        }
        Some(_) => {
            return Err(StepError::Validation {
                step: step.to_string(),
                reason: "depends_on must be a list".to_string(),
            })
        }
    };

    Ok(StepCommon {
        depends_on,
        cache_config: kwargs.remove("cache_config"),
        retry_policies: kwargs.remove("retry_policies"),
        extra: std::mem::take(kwargs),
    })
}

fn take_value(kwargs: &mut ResolvedMap, key: &str, step: &str) -> Result<ResolvedValue, StepError> {
    kwargs.remove(key).ok_or_else(|| StepError::Validation {
        step: step.to_string(),
        reason: format!("missing required field `{key}`"),
    })
}

fn take_string(kwargs: &mut ResolvedMap, key: &str, step: &str) -> Result<String, StepError> {
    match take_value(kwargs, key, step)? {
        ResolvedValue::String(s) => Ok(s),
        _ => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a string"),
        }),
    }
}

fn take_opt_string(
    kwargs: &mut ResolvedMap,
    key: &str,
    step: &str,
) -> Result<Option<String>, StepError> {
    match kwargs.remove(key) {
        None => Ok(None),
        Some(ResolvedValue::String(s)) => Ok(Some(s)),
        Some(_) => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a string"),
        }),
    }
}

fn take_map(kwargs: &mut ResolvedMap, key: &str, step: &str) -> Result<ResolvedMap, StepError> {
    match take_value(kwargs, key, step)? {
        ResolvedValue::Mapping(map) => Ok(map),
        _ => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a mapping"),
        }),
    }
}

fn take_opt_map(
    kwargs: &mut ResolvedMap,
    key: &str,
    step: &str,
) -> Result<Option<ResolvedMap>, StepError> {
    match kwargs.remove(key) {
        None => Ok(None),
        Some(ResolvedValue::Mapping(map)) => Ok(Some(map)),
        Some(_) => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a mapping"),
        }),
    }
}

fn take_sequence(
    kwargs: &mut ResolvedMap,
    key: &str,
    step: &str,
) -> Result<Vec<ResolvedValue>, StepError> {
    match take_value(kwargs, key, step)? {
        ResolvedValue::Sequence(seq) => Ok(seq),
        _ => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a list"),
        }),
    }
}

fn take_opt_sequence(
    kwargs: &mut ResolvedMap,
    key: &str,
    step: &str,
) -> Result<Option<Vec<ResolvedValue>>, StepError> {
    match kwargs.remove(key) {
        None => Ok(None),
        Some(ResolvedValue::Sequence(seq)) => Ok(Some(seq)),
        Some(_) => Err(StepError::Validation {
            step: step.to_string(),
            reason: format!("`{key}` must be a list"),
        }),
    }
}

fn take_property_files(
    kwargs: &mut ResolvedMap,
    step: &str,
) -> Result<Vec<PropertyFile>, StepError> {
    match kwargs.remove("property_files") {
        None => Ok(Vec::new()),
        Some(ResolvedValue::Sequence(seq)) => {
            let mut files = Vec::with_capacity(seq.len());
            for element in seq {
                match element {
                    ResolvedValue::PropertyFile(pf) => files.push(pf),
                    _ => {
                        return Err(StepError::Validation {
                            step: step.to_string(),
                            reason: "property_files entries must be propertyFile references"
                                .to_string(),
                        })
                    }
                }
            }
            Ok(files)
        }
        Some(_) => Err(StepError::Validation {
            step: step.to_string(),
            reason: "property_files must be a list".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::SessionConfig;

    fn kwargs_from_yaml(yaml: &str) -> ResolvedMap {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        match ResolvedValue::from_yaml(&value) {
            ResolvedValue::Mapping(map) => map,
            other => panic!("expected mapping fixture, got {:?}", other),
        }
    }

    fn build_context<'a>(registry: &'a FunctionRegistry, session: &'a SessionConfig) -> BuildContext<'a> {
        BuildContext {
            role: "arn:aws:iam::123456789012:role/pipeline",
            session,
            security_group_ids: &[],
            subnets: &[],
            registry,
        }
    }

    #[test]
    fn test_discriminate_training() {
        let kwargs = kwargs_from_yaml("estimator_kwargs: {}\nfit_kwargs: {}\n");
        assert_eq!(discriminate("train", &kwargs).unwrap(), StepKind::Training);
    }

    #[test]
    fn test_discriminate_tuning_pair() {
        let kwargs =
            kwargs_from_yaml("estimator_kwargs: {}\ntuner_kwargs: {}\nfit_kwargs: {}\n");
        assert_eq!(discriminate("tune", &kwargs).unwrap(), StepKind::Tuning);
    }

    #[test]
    fn test_discriminate_conflicting_pair_fails() {
        let kwargs = kwargs_from_yaml("estimator_kwargs: {}\nprocessor_kwargs: {}\n");
        let err = discriminate("bad", &kwargs).unwrap_err();
        match err {
            StepError::Discrimination { step, matched } => {
                assert_eq!(step, "bad");
                assert_eq!(matched, vec!["estimator_kwargs", "processor_kwargs"]);
            }
            other => panic!("expected discrimination error, got {:?}", other),
        }
    }

    #[test]
    fn test_discriminate_no_match_fails() {
        let kwargs = kwargs_from_yaml("unrelated: true\n");
        assert!(matches!(
            discriminate("empty", &kwargs),
            Err(StepError::Discrimination { .. })
        ));
    }

    #[test]
    fn test_model_step_mutual_exclusivity() {
        let kwargs = kwargs_from_yaml(
            r#"
model_kwargs: {}
create_model_kwargs: {}
register_model_kwargs: {}
"#,
        );
        let err = StepModel::validate("register", kwargs, Branches::default()).unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));

        // Neither option is just as invalid
        let kwargs = kwargs_from_yaml("model_kwargs: {}\n");
        let err = StepModel::validate("register", kwargs, Branches::default()).unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));
    }

    #[test]
    fn test_check_step_mutual_exclusivity() {
        let kwargs = kwargs_from_yaml(
            r#"
check_job_config_kwargs: {}
clarify_check_config: {}
quality_check_config: {}
"#,
        );
        let err = StepModel::validate("check", kwargs, Branches::default()).unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));

        // Neither option is just as invalid
        let kwargs = kwargs_from_yaml("check_job_config_kwargs: {}\n");
        let err = StepModel::validate("check", kwargs, Branches::default()).unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));

        // Exactly one is accepted
        let kwargs = kwargs_from_yaml(
            "check_job_config_kwargs: {}\nquality_check_config: {baseline: s3://b/stats.json}\n",
        );
        assert!(StepModel::validate("check", kwargs, Branches::default()).is_ok());
    }

    #[test]
    fn test_cache_and_retry_rendered() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let kwargs = kwargs_from_yaml(
            r#"
error_message: boom
cache_config:
  enable_caching: true
  expire_after: 30d
retry_policies:
  - max_attempts: 3
"#,
        );

        let step = StepModel::validate("flaky", kwargs, Branches::default())
            .unwrap()
            .build(&build_context(&registry, &session))
            .unwrap();
        let rendered = step.render();

        assert_eq!(rendered["CacheConfig"]["enable_caching"], true);
        assert_eq!(rendered["CacheConfig"]["expire_after"], "30d");
        assert_eq!(rendered["RetryPolicies"][0]["max_attempts"], 3);
    }

    #[test]
    fn test_emr_step_mutual_exclusivity() {
        let kwargs = kwargs_from_yaml(
            r#"
emr_step_config_kwargs: {}
cluster_id: j-123
cluster_config: {}
display_name: spark
description: spark job
"#,
        );
        let err = StepModel::validate("emr", kwargs, Branches::default()).unwrap_err();
        assert!(matches!(err, StepError::Validation { .. }));
    }

    #[test]
    fn test_training_step_build() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let kwargs = kwargs_from_yaml(
            r#"
estimator_kwargs:
  image_uri: image:latest
  instance_type: ml.m5.xlarge
fit_kwargs:
  inputs: s3://bucket/train
"#,
        );

        let model = StepModel::validate("train", kwargs, Branches::default()).unwrap();
        let step = model.build(&build_context(&registry, &session)).unwrap();

        assert_eq!(step.kind, StepKind::Training);
        let args = step.step_args.unwrap();
        assert_eq!(args.helper, "estimator:Estimator");
        assert_eq!(args.action, "fit");
        assert!(args.config.contains_key("role"));
    }

    #[test]
    fn test_tuning_step_wraps_estimator() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let kwargs = kwargs_from_yaml(
            r#"
estimator_kwargs:
  image_uri: image:latest
tuner_kwargs:
  max_jobs: 10
fit_kwargs: {}
"#,
        );

        let model = StepModel::validate("tune", kwargs, Branches::default()).unwrap();
        let step = model.build(&build_context(&registry, &session)).unwrap();

        let args = step.step_args.unwrap();
        assert_eq!(args.helper, "tuner:HyperparameterTuner");
        assert!(matches!(
            args.config.get("estimator"),
            Some(ResolvedValue::Object(_))
        ));
    }

    #[test]
    fn test_unknown_helper_wrapped_as_build_error() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let kwargs = kwargs_from_yaml(
            r#"
processor: processing:NoSuchProcessor
processor_kwargs: {}
step_kwargs: {}
"#,
        );

        let model = StepModel::validate("process", kwargs, Branches::default()).unwrap();
        let err = model.build(&build_context(&registry, &session)).unwrap_err();
        match err {
            StepError::Build { step, source } => {
                assert_eq!(step, "process");
                assert!(source.to_string().contains("NoSuchProcessor"));
            }
            other => panic!("expected build error, got {:?}", other),
        }
    }

    #[test]
    fn test_step_table_take_semantics() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let ctx = build_context(&registry, &session);

        let mut table = StepTable::new();
        for name in ["a", "b"] {
            let kwargs = kwargs_from_yaml("error_message: boom\n");
            let step = StepModel::validate(name, kwargs, Branches::default())
                .unwrap()
                .build(&ctx)
                .unwrap();
            table.insert(step).unwrap();
        }

        let taken = table.take("a").unwrap();
        assert_eq!(taken.name, "a");
        assert!(table.get("a").is_none());
        assert!(table.take("a").is_none());
        assert_eq!(table.names(), vec!["b"]);
    }

    #[test]
    fn test_step_table_rejects_duplicates() {
        let registry = FunctionRegistry::new();
        let session = SessionConfig::default();
        let ctx = build_context(&registry, &session);

        let mut table = StepTable::new();
        for _ in 0..2 {
            let kwargs = kwargs_from_yaml("error_message: boom\n");
            let step = StepModel::validate("dup", kwargs, Branches::default())
                .unwrap()
                .build(&ctx)
                .unwrap();
            if table.get("dup").is_none() {
                table.insert(step).unwrap();
            } else {
                let err = table.insert(step).unwrap_err();
                assert!(matches!(err, BuilderError::DuplicateStep(name) if name == "dup"));
            }
        }
    }

    #[test]
    fn test_name_override_from_kwargs() {
        let kwargs = kwargs_from_yaml("error_message: boom\nname: explicit\n");
        let model = StepModel::validate("key-name", kwargs, Branches::default()).unwrap();
        assert_eq!(model.name(), "explicit");
    }
}
