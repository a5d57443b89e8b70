//! Resolved configuration values
//!
//! `ResolvedValue` is what the reference resolver produces from a raw YAML
//! subtree: the plain YAML shapes survive unchanged, while symbolic tokens
//! become typed runtime leaves (parameters, execution variables, property
//! files, step property accessors, factory-constructed objects).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Map form used throughout resolution; BTreeMap keeps rendering deterministic
pub type ResolvedMap = BTreeMap<String, ResolvedValue>;

/// A fully resolved configuration value
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Null,
    Bool(bool),
    Number(serde_yaml::Number),
    String(String),
    Sequence(Vec<ResolvedValue>),
    Mapping(ResolvedMap),

    /// Pipeline parameter handle (`param:<name>`)
    Parameter(Parameter),

    /// Execution variable constant (`exec:<name>`)
    ExecutionVariable(ExecutionVariable),

    /// Property file handle (`propertyFile:<name>`)
    PropertyFile(PropertyFile),

    /// Lazy accessor into a built step's output properties
    Properties(StepProperty),

    /// Object built by a factory function or factory enum
    Object(Constructed),
}

/// A typed pipeline parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParameterType,
    #[serde(default)]
    pub default_value: Option<serde_yaml::Value>,
}

/// Parameter value types accepted by the execution service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    String,
    Integer,
    Float,
    Boolean,
}

impl ParameterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::String => "String",
            ParameterType::Integer => "Integer",
            ParameterType::Float => "Float",
            ParameterType::Boolean => "Boolean",
        }
    }
}

/// Insertion-ordered parameter table; declaration order carries through to
/// the rendered definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    entries: Vec<Parameter>,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.entries.iter().find(|parameter| parameter.name == name)
    }

    /// Insert a parameter; redefining a name replaces it in place
    pub fn insert(&mut self, parameter: Parameter) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.name == parameter.name)
        {
            Some(slot) => *slot = parameter,
            None => self.entries.push(parameter),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Closed set of execution variables the service substitutes at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionVariable {
    pub name: &'static str,
}

/// All execution variables the service recognizes
pub const EXECUTION_VARIABLES: &[ExecutionVariable] = &[
    ExecutionVariable::PIPELINE_NAME,
    ExecutionVariable::PIPELINE_ARN,
    ExecutionVariable::PIPELINE_EXECUTION_ID,
    ExecutionVariable::PIPELINE_EXECUTION_ARN,
    ExecutionVariable::START_DATETIME,
    ExecutionVariable::CURRENT_DATETIME,
    ExecutionVariable::TRAINING_JOB_NAME,
    ExecutionVariable::PROCESSING_JOB_NAME,
];

impl ExecutionVariable {
    pub const PIPELINE_NAME: Self = Self {
        name: "PIPELINE_NAME",
    };
    pub const PIPELINE_ARN: Self = Self {
        name: "PIPELINE_ARN",
    };
    pub const PIPELINE_EXECUTION_ID: Self = Self {
        name: "PIPELINE_EXECUTION_ID",
    };
    pub const PIPELINE_EXECUTION_ARN: Self = Self {
        name: "PIPELINE_EXECUTION_ARN",
    };
    pub const START_DATETIME: Self = Self {
        name: "START_DATETIME",
    };
    pub const CURRENT_DATETIME: Self = Self {
        name: "CURRENT_DATETIME",
    };
    pub const TRAINING_JOB_NAME: Self = Self {
        name: "TRAINING_JOB_NAME",
    };
    pub const PROCESSING_JOB_NAME: Self = Self {
        name: "PROCESSING_JOB_NAME",
    };

    /// Look up an execution variable by name within the closed set
    pub fn resolve(name: &str) -> Option<Self> {
        EXECUTION_VARIABLES
            .iter()
            .find(|candidate| candidate.name == name)
            .copied()
    }

    /// Wire address of the variable, e.g. `Execution.PipelineName`
    pub fn address(&self) -> String {
        format!("Execution.{}", camel_case(self.name))
    }
}

/// A named property file produced by a processing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyFile {
    pub name: String,
    pub output_name: String,
    pub path: String,
}

/// Lazy property-path accessor rooted at a built step's outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProperty {
    pub step_name: String,
    pub path: String,
}

impl StepProperty {
    /// Wire address of the property, e.g. `Steps.train.ModelArtifacts.S3ModelArtifacts`
    pub fn address(&self) -> String {
        format!("Steps.{}.{}", self.step_name, self.path)
    }
}

/// An object constructed through the factory-function registry
#[derive(Debug, Clone, PartialEq)]
pub struct Constructed {
    /// Qualified constructor name, e.g. `functions:Join`
    pub type_name: String,
    pub kwargs: ResolvedMap,
}

impl ResolvedValue {
    /// Convert a plain YAML value; no symbol resolution happens here
    pub fn from_yaml(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Null => ResolvedValue::Null,
            serde_yaml::Value::Bool(b) => ResolvedValue::Bool(*b),
            serde_yaml::Value::Number(n) => ResolvedValue::Number(n.clone()),
            serde_yaml::Value::String(s) => ResolvedValue::String(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                ResolvedValue::Sequence(seq.iter().map(Self::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => ResolvedValue::Mapping(
                map.iter()
                    .map(|(k, v)| (yaml_key_to_string(k), Self::from_yaml(v)))
                    .collect(),
            ),
            serde_yaml::Value::Tagged(tagged) => Self::from_yaml(&tagged.value),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&ResolvedMap> {
        match self {
            ResolvedValue::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[ResolvedValue]> {
        match self {
            ResolvedValue::Sequence(seq) => Some(seq),
            _ => None,
        }
    }

    /// Render to the JSON shape the execution service consumes
    pub fn render(&self) -> serde_json::Value {
        match self {
            ResolvedValue::Null => serde_json::Value::Null,
            ResolvedValue::Bool(b) => serde_json::Value::Bool(*b),
            ResolvedValue::Number(n) => {
                serde_json::to_value(n).unwrap_or(serde_json::Value::Null)
            }
            ResolvedValue::String(s) => serde_json::Value::String(s.clone()),
            ResolvedValue::Sequence(seq) => {
                serde_json::Value::Array(seq.iter().map(|v| v.render()).collect())
            }
            ResolvedValue::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.render())).collect(),
            ),
            ResolvedValue::Parameter(p) => {
                serde_json::json!({ "Get": format!("Parameters.{}", p.name) })
            }
            ResolvedValue::ExecutionVariable(ev) => {
                serde_json::json!({ "Get": ev.address() })
            }
            ResolvedValue::PropertyFile(pf) => serde_json::json!({
                "PropertyFileName": pf.name,
                "OutputName": pf.output_name,
                "FilePath": pf.path,
            }),
            ResolvedValue::Properties(prop) => {
                serde_json::json!({ "Get": prop.address() })
            }
            ResolvedValue::Object(obj) => obj.render(),
        }
    }
}

impl Constructed {
    fn render(&self) -> serde_json::Value {
        let kwargs: serde_json::Map<String, serde_json::Value> = self
            .kwargs
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect();

        // Join and JsonGet are intrinsic service functions with their own
        // wire shape; everything else renders as a tagged object.
        match self.type_name.as_str() {
            "functions:Join" => serde_json::json!({ "Std:Join": kwargs }),
            "functions:JsonGet" => serde_json::json!({ "Std:JsonGet": kwargs }),
            other => serde_json::json!({ other: kwargs }),
        }
    }
}

/// Stringify a YAML mapping key; configuration keys are expected to be
/// scalars, anything else falls back to its YAML rendering
pub fn yaml_key_to_string(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// SCREAMING_SNAKE_CASE to CamelCase, used for execution variable addresses
fn camel_case(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let lower = part.to_ascii_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_round_trip_shapes() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
name: train
count: 3
nested:
  enabled: true
items:
  - a
  - 2
"#,
        )
        .unwrap();

        let resolved = ResolvedValue::from_yaml(&yaml);
        let map = resolved.as_mapping().unwrap();
        assert_eq!(map.get("name").unwrap().as_str(), Some("train"));
        assert_eq!(
            map.get("nested").unwrap().as_mapping().unwrap().get("enabled"),
            Some(&ResolvedValue::Bool(true))
        );
        assert_eq!(map.get("items").unwrap().as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn test_execution_variable_closed_set() {
        assert_eq!(
            ExecutionVariable::resolve("PIPELINE_NAME"),
            Some(ExecutionVariable::PIPELINE_NAME)
        );
        assert!(ExecutionVariable::resolve("NOT_A_VARIABLE").is_none());
        assert_eq!(EXECUTION_VARIABLES.len(), 8);
    }

    #[test]
    fn test_parameter_table_order_and_replace() {
        let mut table = ParameterTable::new();
        for name in ["zeta", "alpha", "mid"] {
            table.insert(Parameter {
                name: name.to_string(),
                param_type: ParameterType::String,
                default_value: None,
            });
        }
        // Redefinition keeps the original position
        table.insert(Parameter {
            name: "alpha".to_string(),
            param_type: ParameterType::Integer,
            default_value: None,
        });

        let names: Vec<&str> = table.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            table.get("alpha").map(|p| p.param_type),
            Some(ParameterType::Integer)
        );
    }

    #[test]
    fn test_execution_variable_address() {
        let ev = ExecutionVariable::resolve("PIPELINE_EXECUTION_ID").unwrap();
        assert_eq!(ev.address(), "Execution.PipelineExecutionId");
    }

    #[test]
    fn test_parameter_render() {
        let value = ResolvedValue::Parameter(Parameter {
            name: "instance_count".to_string(),
            param_type: ParameterType::Integer,
            default_value: None,
        });
        assert_eq!(
            value.render(),
            serde_json::json!({ "Get": "Parameters.instance_count" })
        );
    }

    #[test]
    fn test_join_render() {
        let mut kwargs = ResolvedMap::new();
        kwargs.insert("on".to_string(), ResolvedValue::String("/".to_string()));
        kwargs.insert(
            "values".to_string(),
            ResolvedValue::Sequence(vec![
                ResolvedValue::String("s3://bucket".to_string()),
                ResolvedValue::String("prefix".to_string()),
            ]),
        );
        let value = ResolvedValue::Object(Constructed {
            type_name: "functions:Join".to_string(),
            kwargs,
        });
        let rendered = value.render();
        assert!(rendered.get("Std:Join").is_some());
    }
}
