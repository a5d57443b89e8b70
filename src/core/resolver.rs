//! Symbolic reference resolution
//!
//! Walks a raw configuration subtree and replaces typed placeholder tokens
//! with runtime values:
//!
//! - `param:<name>` -> pipeline parameter handle
//! - `exec:<name>` -> execution variable constant
//! - `propertyFile:<name>` -> property file handle
//! - `<step>.properties.<path>` -> lazy step property accessor
//! - `{factory_function: ..., kwargs: ...}` -> constructed object
//! - `{factory_enum: ...}` -> enum constant
//!
//! Resolution is a pure function of the node and the environment; the
//! caller's tables are only read, never mutated.

use crate::core::error::ResolveError;
use crate::core::registry::FunctionRegistry;
use crate::core::step::StepTable;
use crate::core::value::{
    yaml_key_to_string, ParameterTable, PropertyFile, ResolvedMap, ResolvedValue, StepProperty,
};
use std::collections::BTreeMap;

pub const PARAMETER_PREFIX: &str = "param:";
pub const EXECUTION_VARIABLE_PREFIX: &str = "exec:";
pub const PROPERTY_FILE_PREFIX: &str = "propertyFile:";
pub const PROPERTIES_IDENTIFIER: &str = ".properties.";
pub const FACTORY_FUNCTION: &str = "factory_function";
pub const FACTORY_ENUM: &str = "factory_enum";

/// Read-only view of the assembler's live tables
pub struct ResolutionEnv<'a> {
    pub parameters: &'a ParameterTable,
    pub property_files: &'a BTreeMap<String, PropertyFile>,
    pub steps: &'a StepTable,
    pub registry: &'a FunctionRegistry,
}

/// Resolve a single scalar argument; strings without a recognized token
/// pass through as literals
pub fn resolve_argument(
    argument: &str,
    env: &ResolutionEnv,
) -> Result<ResolvedValue, ResolveError> {
    if let Some(name) = argument.strip_prefix(PARAMETER_PREFIX) {
        let parameter = env
            .parameters
            .get(name)
            .ok_or_else(|| ResolveError::UnknownParameter(name.to_string()))?;
        return Ok(ResolvedValue::Parameter(parameter.clone()));
    }

    if let Some(name) = argument.strip_prefix(EXECUTION_VARIABLE_PREFIX) {
        let variable = crate::core::value::ExecutionVariable::resolve(name)
            .ok_or_else(|| ResolveError::UnknownExecutionVariable(name.to_string()))?;
        return Ok(ResolvedValue::ExecutionVariable(variable));
    }

    if let Some(name) = argument.strip_prefix(PROPERTY_FILE_PREFIX) {
        let property_file = env
            .property_files
            .get(name)
            .ok_or_else(|| ResolveError::UnknownPropertyFile(name.to_string()))?;
        return Ok(ResolvedValue::PropertyFile(property_file.clone()));
    }

    if let Some(index) = argument.find(PROPERTIES_IDENTIFIER) {
        let step_name = &argument[..index];
        let path = &argument[index + PROPERTIES_IDENTIFIER.len()..];
        if env.steps.get(step_name).is_none() {
            return Err(ResolveError::UnknownStep(step_name.to_string()));
        }
        // Resolved lazily against the already built step: only existence is
        // checked here, the path is carried through to the definition.
        return Ok(ResolvedValue::Properties(StepProperty {
            step_name: step_name.to_string(),
            path: path.to_string(),
        }));
    }

    Ok(ResolvedValue::String(argument.to_string()))
}

/// Recursively resolve an arbitrary nested configuration subtree
pub fn resolve_tree(
    node: &serde_yaml::Value,
    env: &ResolutionEnv,
) -> Result<ResolvedValue, ResolveError> {
    match node {
        serde_yaml::Value::Mapping(map) => resolve_mapping(map, env),
        serde_yaml::Value::Sequence(seq) => {
            let mut resolved = Vec::with_capacity(seq.len());
            for element in seq {
                match element {
                    serde_yaml::Value::Mapping(_) => resolved.push(resolve_tree(element, env)?),
                    serde_yaml::Value::String(s) => resolved.push(resolve_argument(s, env)?),
                    other => resolved.push(ResolvedValue::from_yaml(other)),
                }
            }
            Ok(ResolvedValue::Sequence(resolved))
        }
        serde_yaml::Value::String(s) => resolve_argument(s, env),
        other => Ok(ResolvedValue::from_yaml(other)),
    }
}

/// Factory-function detection runs before generic mapping resolution
fn resolve_mapping(
    map: &serde_yaml::Mapping,
    env: &ResolutionEnv,
) -> Result<ResolvedValue, ResolveError> {
    if let Some(function) = map.get(FACTORY_FUNCTION) {
        return resolve_factory_function(map, function, env);
    }

    if let Some(name) = map.get(FACTORY_ENUM) {
        let qualified = name.as_str().ok_or_else(|| {
            ResolveError::InvalidFactory(format!("{FACTORY_ENUM} must be a string"))
        })?;
        return env.registry.resolve_enum(qualified);
    }

    let mut resolved = ResolvedMap::new();
    for (key, value) in map {
        resolved.insert(yaml_key_to_string(key), resolve_tree(value, env)?);
    }
    Ok(ResolvedValue::Mapping(resolved))
}

fn resolve_factory_function(
    map: &serde_yaml::Mapping,
    function: &serde_yaml::Value,
    env: &ResolutionEnv,
) -> Result<ResolvedValue, ResolveError> {
    let type_name = function.as_str().ok_or_else(|| {
        ResolveError::InvalidFactory(format!("{FACTORY_FUNCTION} must be a string"))
    })?;

    for (key, _) in map {
        let key = yaml_key_to_string(key);
        if key != FACTORY_FUNCTION && key != "kwargs" {
            return Err(ResolveError::InvalidFactory(format!(
                "unexpected key '{key}' alongside {FACTORY_FUNCTION}"
            )));
        }
    }

    let kwargs = match map.get("kwargs") {
        Some(serde_yaml::Value::Mapping(kwargs)) => match resolve_mapping(kwargs, env)? {
            ResolvedValue::Mapping(resolved) => resolved,
            // A factory call nested directly under kwargs collapses the
            // submap; reject it so the mistake surfaces at the call site.
            _ => {
                return Err(ResolveError::InvalidFactory(
                    "kwargs must resolve to a mapping".to_string(),
                ))
            }
        },
        Some(_) => {
            return Err(ResolveError::InvalidFactory(
                "kwargs must be a mapping".to_string(),
            ))
        }
        None => ResolvedMap::new(),
    };

    env.registry.construct(type_name, kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::{Parameter, ParameterType, PropertyFile};

    struct Fixture {
        parameters: ParameterTable,
        property_files: BTreeMap<String, PropertyFile>,
        steps: StepTable,
        registry: FunctionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let mut parameters = ParameterTable::new();
            parameters.insert(Parameter {
                name: "instance_count".to_string(),
                param_type: ParameterType::Integer,
                default_value: None,
            });

            let mut property_files = BTreeMap::new();
            property_files.insert(
                "metrics".to_string(),
                PropertyFile {
                    name: "metrics".to_string(),
                    output_name: "evaluation".to_string(),
                    path: "metrics.json".to_string(),
                },
            );

            Self {
                parameters,
                property_files,
                steps: StepTable::new(),
                registry: FunctionRegistry::new(),
            }
        }

        fn env(&self) -> ResolutionEnv<'_> {
            ResolutionEnv {
                parameters: &self.parameters,
                property_files: &self.property_files,
                steps: &self.steps,
                registry: &self.registry,
            }
        }
    }

    #[test]
    fn test_resolve_parameter() {
        let fixture = Fixture::new();
        let value = resolve_argument("param:instance_count", &fixture.env()).unwrap();
        match value {
            ResolvedValue::Parameter(p) => assert_eq!(p.name, "instance_count"),
            other => panic!("expected parameter, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_unknown_parameter() {
        let fixture = Fixture::new();
        let err = resolve_argument("param:missing", &fixture.env()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownParameter(name) if name == "missing"));
    }

    #[test]
    fn test_resolve_execution_variable() {
        let fixture = Fixture::new();
        let value = resolve_argument("exec:PIPELINE_NAME", &fixture.env()).unwrap();
        assert!(matches!(value, ResolvedValue::ExecutionVariable(_)));

        let err = resolve_argument("exec:NOT_REAL", &fixture.env()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownExecutionVariable(_)));
    }

    #[test]
    fn test_resolve_property_file() {
        let fixture = Fixture::new();
        let value = resolve_argument("propertyFile:metrics", &fixture.env()).unwrap();
        assert!(matches!(value, ResolvedValue::PropertyFile(_)));

        let err = resolve_argument("propertyFile:missing", &fixture.env()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownPropertyFile(_)));
    }

    #[test]
    fn test_resolve_unknown_step_properties() {
        let fixture = Fixture::new();
        let err =
            resolve_argument("train.properties.ModelArtifacts", &fixture.env()).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownStep(name) if name == "train"));
    }

    #[test]
    fn test_literal_passthrough() {
        let fixture = Fixture::new();
        let value = resolve_argument("just a plain string", &fixture.env()).unwrap();
        assert_eq!(value.as_str(), Some("just a plain string"));
    }

    #[test]
    fn test_resolve_tree_literal_only_is_noop() {
        let fixture = Fixture::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
image_uri: 1234.dkr.ecr.us-west-2.amazonaws.com/train:latest
instance_type: ml.m5.xlarge
count: 2
entrypoint:
  - python
  - train.py
"#,
        )
        .unwrap();

        let resolved = resolve_tree(&yaml, &fixture.env()).unwrap();
        assert_eq!(resolved, ResolvedValue::from_yaml(&yaml));
    }

    #[test]
    fn test_resolve_mixed_sequence() {
        let fixture = Fixture::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
- "--instances"
- param:instance_count
- factory_function: functions:Join
  kwargs:
    on: "/"
    values: [s3://bucket, data]
"#,
        )
        .unwrap();

        let resolved = resolve_tree(&yaml, &fixture.env()).unwrap();
        let seq = resolved.as_sequence().unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0].as_str(), Some("--instances"));
        assert!(matches!(seq[1], ResolvedValue::Parameter(_)));
        assert!(matches!(seq[2], ResolvedValue::Object(_)));
    }

    #[test]
    fn test_resolve_factory_enum() {
        let fixture = Fixture::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            "factory_enum: workflow:ExecutionVariables:PIPELINE_EXECUTION_ID",
        )
        .unwrap();

        let resolved = resolve_tree(&yaml, &fixture.env()).unwrap();
        assert!(matches!(resolved, ResolvedValue::ExecutionVariable(_)));
    }

    #[test]
    fn test_factory_function_rejects_stray_keys() {
        let fixture = Fixture::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
factory_function: functions:Join
kwargs: {}
extra: true
"#,
        )
        .unwrap();

        let err = resolve_tree(&yaml, &fixture.env()).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidFactory(_)));
    }

    #[test]
    fn test_resolver_does_not_mutate_input() {
        let fixture = Fixture::new();
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("args: [param:instance_count]").unwrap();
        let snapshot = yaml.clone();

        let _ = resolve_tree(&yaml, &fixture.env()).unwrap();
        assert_eq!(yaml, snapshot);
    }
}
