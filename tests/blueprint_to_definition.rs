//! End-to-end: layered blueprint files through assembly to a rendered
//! definition document.

use pipegraph::core::blueprint::{Blueprint, MergeStrategy};
use pipegraph::core::builder::{PipelineBuilder, SessionConfig, Tag};
use pipegraph::service::{LocalPipelineService, PipelineService};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

const ROOT_DOC: &str = r#"
backends:
  - base
  - env
context:
  - env
hierarchy:
  - "%{env}"
  - common
base:
  datadir: data/base
env:
  datadir: data/env
"#;

const COMMON_DOC: &str = r#"
resource_config:
  region: us-west-2
  execution_role: arn:aws:iam::123456789012:role/base
  security_group_ids: [sg-1]
  subnets: [subnet-1, subnet-2]
session_bucket: shared-bucket
tags:
  - Key: team
    Value: x
training:
  name: training-pipeline
  parameters:
    instance_count:
      type: parameters:Integer
      default: 1
  property_files:
    metrics:
      output_name: evaluation
      path: metrics.json
  preprocess:
    processor_kwargs:
      image_uri: preprocess:latest
    step_kwargs:
      arguments:
        - "--instances"
        - param:instance_count
    property_files: [propertyFile:metrics]
  train:
    estimator_kwargs:
      image_uri: train:latest
    fit_kwargs:
      inputs: preprocess.properties.ProcessingOutputConfig.Outputs
    depends_on: [preprocess]
"#;

const PROD_DOC: &str = r#"
resource_config:
  execution_role: arn:aws:iam::123456789012:role/prod
training:
  train:
    estimator_kwargs:
      image_uri: train:prod
    fit_kwargs:
      inputs: preprocess.properties.ProcessingOutputConfig.Outputs
"#;

fn write_fixture(files: &[(&str, &str)]) -> PathBuf {
    let root = std::env::temp_dir().join(format!("pipegraph_e2e_{}", uuid::Uuid::new_v4()));
    for (relative, content) in files {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    root
}

fn prod_blueprint(root: &Path) -> Blueprint {
    let mut blueprint = Blueprint::load(root.join("blueprint.yaml")).unwrap();
    blueprint.set_context("env", "prod");
    blueprint
}

fn assemble(blueprint: &Blueprint) -> PipelineBuilder {
    let resources = blueprint.get_definition("resource_config").unwrap();
    let document = blueprint.get_definition("training").unwrap();

    let session = SessionConfig {
        default_bucket: blueprint
            .get("session_bucket", MergeStrategy::First, false)
            .unwrap()
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string),
        region: resources
            .get("region")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    let mut builder = PipelineBuilder::new()
        .set_name(document.get("name").and_then(Value::as_str).unwrap())
        .set_role_arn(resources.get("execution_role").and_then(Value::as_str).unwrap())
        .set_session(session)
        .add_security_group_ids(string_list(resources.get("security_group_ids")))
        .add_subnets(string_list(resources.get("subnets")));

    builder = builder
        .add_parameters(document.get("parameters").unwrap())
        .unwrap()
        .add_property_files(document.get("property_files").unwrap())
        .unwrap()
        .add_steps(&document)
        .unwrap();

    let tags: Vec<Tag> = serde_yaml::from_value(
        blueprint
            .get("tags", MergeStrategy::First, false)
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    builder.add_tags(tags)
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

#[test]
fn prod_layer_overrides_and_fills_gaps() {
    let root = write_fixture(&[
        ("blueprint.yaml", ROOT_DOC),
        ("data/base/common.yaml", COMMON_DOC),
        ("data/base/prod.yaml", PROD_DOC),
    ]);
    let blueprint = prod_blueprint(&root);

    // Scalar override from the prod layer
    let resources = blueprint.get_definition("resource_config").unwrap();
    assert_eq!(
        resources.get("execution_role").and_then(Value::as_str),
        Some("arn:aws:iam::123456789012:role/prod")
    );
    // Untouched keys fall through from common
    assert_eq!(
        resources.get("region").and_then(Value::as_str),
        Some("us-west-2")
    );

    // Tags defined only in the base layer come back unchanged
    let tags = blueprint.get_definition("tags").unwrap();
    let expected: Value = serde_yaml::from_str("- Key: team\n  Value: x\n").unwrap();
    assert_eq!(tags, expected);
}

#[test]
fn full_definition_from_layered_blueprint() {
    let root = write_fixture(&[
        ("blueprint.yaml", ROOT_DOC),
        ("data/base/common.yaml", COMMON_DOC),
        ("data/base/prod.yaml", PROD_DOC),
    ]);
    let blueprint = prod_blueprint(&root);

    let builder = assemble(&blueprint).build().unwrap();
    let definition = builder.definition().unwrap();

    assert_eq!(definition["Version"], "2020-12-01");
    assert_eq!(definition["Parameters"][0]["Name"], "instance_count");
    assert_eq!(definition["Parameters"][0]["DefaultValue"], 1);

    let steps = definition["Steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);

    assert_eq!(steps[0]["Name"], "preprocess");
    assert_eq!(steps[0]["Type"], "Processing");
    assert_eq!(steps[0]["PropertyFiles"][0]["OutputName"], "evaluation");
    assert_eq!(
        steps[0]["Arguments"]["Arguments"]["arguments"][1],
        serde_json::json!({ "Get": "Parameters.instance_count" })
    );

    assert_eq!(steps[1]["Name"], "train");
    assert_eq!(steps[1]["Type"], "Training");
    assert_eq!(steps[1]["DependsOn"], serde_json::json!(["preprocess"]));
    // Prod layer won the estimator image
    assert_eq!(
        steps[1]["Arguments"]["HelperConfig"]["image_uri"],
        "train:prod"
    );
    assert_eq!(
        steps[1]["Arguments"]["Arguments"]["inputs"],
        serde_json::json!({ "Get": "Steps.preprocess.ProcessingOutputConfig.Outputs" })
    );
}

#[tokio::test]
async fn upsert_and_run_round_trip() {
    let root = write_fixture(&[
        ("blueprint.yaml", ROOT_DOC),
        ("data/base/common.yaml", COMMON_DOC),
    ]);
    let blueprint = prod_blueprint(&root);
    let builder = assemble(&blueprint).build().unwrap();

    let service = LocalPipelineService::new();
    let summary = builder.upsert(&service).await.unwrap();
    assert_eq!(summary.name, "training-pipeline");
    assert_eq!(
        service.tags("training-pipeline").unwrap(),
        vec![Tag {
            key: "team".to_string(),
            value: "x".to_string(),
        }]
    );

    let handle = builder
        .run(&service, std::collections::BTreeMap::new())
        .await
        .unwrap();
    let description = service
        .describe_execution(&handle.execution_id)
        .await
        .unwrap();
    assert!(description.status.is_terminal());
}

#[test]
fn condition_branches_consume_steps() {
    let root = write_fixture(&[
        ("blueprint.yaml", ROOT_DOC),
        (
            "data/base/common.yaml",
            r#"
resource_config:
  execution_role: arn:aws:iam::123456789012:role/base
gated:
  name: gated-pipeline
  deploy:
    error_message: deploy placeholder
  alarm:
    error_message: accuracy below threshold
  gate:
    conditions:
      - factory_function: functions:JsonGet
        kwargs:
          json_path: metrics.accuracy
    if_steps: [deploy]
    else_steps: [alarm]
"#,
        ),
    ]);
    let blueprint = prod_blueprint(&root);

    let document = blueprint.get_definition("gated").unwrap();
    let builder = PipelineBuilder::new()
        .set_name("gated-pipeline")
        .set_role_arn("arn:aws:iam::123456789012:role/base")
        .add_steps(&document)
        .unwrap()
        .build()
        .unwrap();

    let definition = builder.definition().unwrap();
    let steps = definition["Steps"].as_array().unwrap();

    // Branch steps are owned by the condition step, not the top level
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["Type"], "Condition");
    assert_eq!(steps[0]["IfSteps"][0]["Name"], "deploy");
    assert_eq!(steps[0]["ElseSteps"][0]["Name"], "alarm");
    assert!(steps[0]["Conditions"][0].get("Std:JsonGet").is_some());
}
