//! Constructor registry for resolve-by-name lookups
//!
//! The blueprint format names constructors, enums, and helper objects by
//! qualified strings (`module:Name`). Rather than dynamic loading, every name
//! the resolver may encounter is registered here at process start.

use crate::core::error::ResolveError;
use crate::core::value::{Constructed, Parameter, ParameterType, ResolvedMap, ResolvedValue};
use std::collections::HashMap;

/// Qualified class path of the execution variable enum
pub const EXECUTION_VARIABLES_CLASS_PATH: &str = "workflow:ExecutionVariables";

/// A factory-function constructor
pub type ConstructorFn = fn(&str, ResolvedMap) -> Result<ResolvedValue, ResolveError>;

/// A helper object kind with its supported action methods
#[derive(Debug, Clone)]
pub struct HelperKind {
    pub type_name: &'static str,
    pub actions: &'static [&'static str],
}

/// Registry mapping qualified name strings to constructors, enum constants,
/// and helper kinds
#[derive(Debug)]
pub struct FunctionRegistry {
    constructors: HashMap<String, ConstructorFn>,
    enums: HashMap<String, ResolvedValue>,
    helpers: HashMap<String, HelperKind>,
}

/// Default constructor: package the resolved kwargs into a tagged object
fn construct_object(type_name: &str, kwargs: ResolvedMap) -> Result<ResolvedValue, ResolveError> {
    Ok(ResolvedValue::Object(Constructed {
        type_name: type_name.to_string(),
        kwargs,
    }))
}

const DEFAULT_CONSTRUCTORS: &[&str] = &[
    "functions:Join",
    "functions:JsonGet",
    "network:NetworkConfig",
    "processing:ProcessingInput",
    "processing:ProcessingOutput",
    "training:TrainingInput",
    "tuner:ContinuousParameter",
    "tuner:IntegerParameter",
    "tuner:CategoricalParameter",
    "workflow:CacheConfig",
    "workflow:RetryPolicy",
];

const DEFAULT_HELPERS: &[HelperKind] = &[
    HelperKind {
        type_name: "processing:Processor",
        actions: &["run"],
    },
    HelperKind {
        type_name: "processing:ScriptProcessor",
        actions: &["run"],
    },
    HelperKind {
        type_name: "estimator:Estimator",
        actions: &["fit"],
    },
    HelperKind {
        type_name: "model:Model",
        actions: &["create", "register"],
    },
    HelperKind {
        type_name: "transformer:Transformer",
        actions: &["transform"],
    },
    HelperKind {
        type_name: "tuner:HyperparameterTuner",
        actions: &["fit"],
    },
    HelperKind {
        type_name: "automl:AutoML",
        actions: &["fit"],
    },
    // Lambda functions are attached to their step whole, no action method
    HelperKind {
        type_name: "lambda:Lambda",
        actions: &[],
    },
];

impl FunctionRegistry {
    /// Registry with the built-in constructor, enum, and helper sets
    pub fn new() -> Self {
        let mut constructors: HashMap<String, ConstructorFn> = HashMap::new();
        for name in DEFAULT_CONSTRUCTORS {
            constructors.insert(name.to_string(), construct_object as ConstructorFn);
        }

        let mut enums = HashMap::new();
        for variable in crate::core::value::EXECUTION_VARIABLES {
            enums.insert(
                format!("{EXECUTION_VARIABLES_CLASS_PATH}:{}", variable.name),
                ResolvedValue::ExecutionVariable(*variable),
            );
        }

        let mut helpers = HashMap::new();
        for kind in DEFAULT_HELPERS {
            helpers.insert(kind.type_name.to_string(), kind.clone());
        }

        Self {
            constructors,
            enums,
            helpers,
        }
    }

    /// Register an additional factory function
    pub fn register_function(&mut self, name: &str, ctor: ConstructorFn) {
        self.constructors.insert(name.to_string(), ctor);
    }

    /// Register an additional enum constant under `class_path:member`
    pub fn register_enum(&mut self, qualified: &str, value: ResolvedValue) {
        self.enums.insert(qualified.to_string(), value);
    }

    /// Invoke the constructor registered under `type_name`
    pub fn construct(
        &self,
        type_name: &str,
        kwargs: ResolvedMap,
    ) -> Result<ResolvedValue, ResolveError> {
        let ctor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| ResolveError::UnknownFunction(type_name.to_string()))?;
        ctor(type_name, kwargs)
    }

    /// Resolve an enum constant named as `module:Class:MEMBER`
    pub fn resolve_enum(&self, qualified: &str) -> Result<ResolvedValue, ResolveError> {
        self.enums
            .get(qualified)
            .cloned()
            .ok_or_else(|| ResolveError::UnknownEnum(qualified.to_string()))
    }

    /// Look up a helper kind by qualified name
    pub fn helper(&self, type_name: &str) -> Result<&HelperKind, ResolveError> {
        self.helpers
            .get(type_name)
            .ok_or_else(|| ResolveError::UnknownHelper(type_name.to_string()))
    }

    /// Construct a typed pipeline parameter; `type_name` follows the
    /// `parameters:<Type>` convention
    pub fn parameter(
        &self,
        type_name: &str,
        name: &str,
        default_value: Option<serde_yaml::Value>,
    ) -> Result<Parameter, ResolveError> {
        let param_type = match type_name {
            "parameters:String" => ParameterType::String,
            "parameters:Integer" => ParameterType::Integer,
            "parameters:Float" => ParameterType::Float,
            "parameters:Boolean" => ParameterType::Boolean,
            other => return Err(ResolveError::UnknownFunction(other.to_string())),
        };
        Ok(Parameter {
            name: name.to_string(),
            param_type,
            default_value,
        })
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HelperKind {
    /// Instantiate the helper with its resolved constructor kwargs
    pub fn construct(&self, config: ResolvedMap) -> Helper {
        Helper {
            type_name: self.type_name.to_string(),
            actions: self.actions,
            config,
        }
    }
}

/// A constructed helper object (processor, estimator, model, ...)
#[derive(Debug, Clone)]
pub struct Helper {
    pub type_name: String,
    pub config: ResolvedMap,
    actions: &'static [&'static str],
}

impl Helper {
    /// Invoke a named action method, producing the step arguments the
    /// execution service runs
    pub fn invoke(
        &self,
        action: &str,
        arguments: ResolvedMap,
    ) -> Result<StepArguments, ResolveError> {
        if !self.actions.contains(&action) {
            return Err(ResolveError::UnknownAction {
                helper: self.type_name.clone(),
                action: action.to_string(),
            });
        }
        Ok(StepArguments {
            helper: self.type_name.clone(),
            config: self.config.clone(),
            action: action.to_string(),
            arguments,
        })
    }
}

/// Arguments a built step hands to the execution service
#[derive(Debug, Clone, PartialEq)]
pub struct StepArguments {
    pub helper: String,
    pub config: ResolvedMap,
    pub action: String,
    pub arguments: ResolvedMap,
}

impl StepArguments {
    pub fn render(&self) -> serde_json::Value {
        let config: serde_json::Map<String, serde_json::Value> = self
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect();
        let arguments: serde_json::Map<String, serde_json::Value> = self
            .arguments
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect();
        serde_json::json!({
            "Helper": self.helper,
            "HelperConfig": config,
            "Action": self.action,
            "Arguments": arguments,
        })
    }
}
