//! Pipeline execution service interface
//!
//! The builder talks to an execution service through `PipelineService`.
//! `LocalPipelineService` is an in-process implementation backing the CLI's
//! dry runs and the test suite; a remote implementation plugs in behind the
//! same trait.

use crate::core::builder::Tag;
use crate::core::error::ServiceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

/// Lifecycle states of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Executing,
    Stopping,
    Stopped,
    Failed,
    Succeeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Executing => "Executing",
            ExecutionStatus::Stopping => "Stopping",
            ExecutionStatus::Stopped => "Stopped",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Succeeded => "Succeeded",
        }
    }

    /// Whether the execution has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Stopped | ExecutionStatus::Failed | ExecutionStatus::Succeeded
        )
    }
}

/// Summary of a registered pipeline
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub name: String,
    pub arn: String,
    pub last_modified: DateTime<Utc>,
}

/// Handle to a started execution
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub arn: String,
    pub started_at: DateTime<Utc>,
}

/// Point-in-time view of an execution
#[derive(Debug, Clone)]
pub struct ExecutionDescription {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub failure_reason: Option<String>,
}

#[async_trait]
pub trait PipelineService: Send + Sync {
    /// Look up a pipeline by name; `None` when it has never been upserted
    async fn describe(&self, name: &str) -> Result<Option<PipelineSummary>, ServiceError>;

    /// Create the pipeline or replace its definition
    async fn upsert(
        &self,
        name: &str,
        definition: serde_json::Value,
        tags: &[Tag],
    ) -> Result<PipelineSummary, ServiceError>;

    /// Start an execution with parameter overrides
    async fn start(
        &self,
        name: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<ExecutionHandle, ServiceError>;

    /// Describe a running or finished execution
    async fn describe_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionDescription, ServiceError>;
}

struct StoredPipeline {
    summary: PipelineSummary,
    definition: serde_json::Value,
    tags: Vec<Tag>,
}

struct StoredExecution {
    description: ExecutionDescription,
    parameters: BTreeMap<String, String>,
}

/// In-process pipeline store; executions complete immediately
pub struct LocalPipelineService {
    pipelines: Mutex<HashMap<String, StoredPipeline>>,
    executions: Mutex<HashMap<String, StoredExecution>>,
}

impl Default for LocalPipelineService {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPipelineService {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Definition currently stored for a pipeline
    pub fn definition(&self, name: &str) -> Result<serde_json::Value, ServiceError> {
        let pipelines = self.lock_pipelines()?;
        pipelines
            .get(name)
            .map(|stored| stored.definition.clone())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Tags recorded at the last upsert
    pub fn tags(&self, name: &str) -> Result<Vec<Tag>, ServiceError> {
        let pipelines = self.lock_pipelines()?;
        pipelines
            .get(name)
            .map(|stored| stored.tags.clone())
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))
    }

    /// Parameter overrides an execution was started with
    pub fn execution_parameters(
        &self,
        execution_id: &str,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        let executions = self.lock_executions()?;
        executions
            .get(execution_id)
            .map(|stored| stored.parameters.clone())
            .ok_or_else(|| ServiceError::ExecutionNotFound(execution_id.to_string()))
    }

    fn lock_pipelines(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredPipeline>>, ServiceError> {
        self.pipelines
            .lock()
            .map_err(|_| ServiceError::Request("pipeline store poisoned".to_string()))
    }

    fn lock_executions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredExecution>>, ServiceError> {
        self.executions
            .lock()
            .map_err(|_| ServiceError::Request("execution store poisoned".to_string()))
    }
}

#[async_trait]
impl PipelineService for LocalPipelineService {
    async fn describe(&self, name: &str) -> Result<Option<PipelineSummary>, ServiceError> {
        let pipelines = self.lock_pipelines()?;
        Ok(pipelines.get(name).map(|stored| stored.summary.clone()))
    }

    async fn upsert(
        &self,
        name: &str,
        definition: serde_json::Value,
        tags: &[Tag],
    ) -> Result<PipelineSummary, ServiceError> {
        let mut pipelines = self.lock_pipelines()?;
        let summary = PipelineSummary {
            name: name.to_string(),
            arn: format!("arn:pipeline:local:{name}"),
            last_modified: Utc::now(),
        };
        pipelines.insert(
            name.to_string(),
            StoredPipeline {
                summary: summary.clone(),
                definition,
                tags: tags.to_vec(),
            },
        );
        Ok(summary)
    }

    async fn start(
        &self,
        name: &str,
        parameters: BTreeMap<String, String>,
    ) -> Result<ExecutionHandle, ServiceError> {
        {
            let pipelines = self.lock_pipelines()?;
            if !pipelines.contains_key(name) {
                return Err(ServiceError::NotFound(name.to_string()));
            }
        }

        let execution_id = Uuid::new_v4().to_string();
        let handle = ExecutionHandle {
            execution_id: execution_id.clone(),
            arn: format!("arn:pipeline:local:{name}/execution/{execution_id}"),
            started_at: Utc::now(),
        };

        let mut executions = self.lock_executions()?;
        executions.insert(
            execution_id.clone(),
            StoredExecution {
                description: ExecutionDescription {
                    execution_id,
                    status: ExecutionStatus::Succeeded,
                    failure_reason: None,
                },
                parameters,
            },
        );
        Ok(handle)
    }

    async fn describe_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionDescription, ServiceError> {
        let executions = self.lock_executions()?;
        executions
            .get(execution_id)
            .map(|stored| stored.description.clone())
            .ok_or_else(|| ServiceError::ExecutionNotFound(execution_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_describe_unknown_pipeline() {
        let service = LocalPipelineService::new();
        assert!(service.describe("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_then_describe() {
        let service = LocalPipelineService::new();
        let summary = service
            .upsert("demo", serde_json::json!({"Steps": []}), &[])
            .await
            .unwrap();
        assert_eq!(summary.name, "demo");

        let described = service.describe("demo").await.unwrap().unwrap();
        assert_eq!(described.arn, summary.arn);
        assert_eq!(
            service.definition("demo").unwrap(),
            serde_json::json!({"Steps": []})
        );
    }

    #[tokio::test]
    async fn test_start_requires_pipeline() {
        let service = LocalPipelineService::new();
        let err = service.start("missing", BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_start_and_describe_execution() {
        let service = LocalPipelineService::new();
        service
            .upsert("demo", serde_json::json!({}), &[])
            .await
            .unwrap();

        let mut parameters = BTreeMap::new();
        parameters.insert("instance_count".to_string(), "2".to_string());
        let handle = service.start("demo", parameters).await.unwrap();

        let description = service
            .describe_execution(&handle.execution_id)
            .await
            .unwrap();
        assert!(description.status.is_terminal());
        assert_eq!(description.status, ExecutionStatus::Succeeded);

        let recorded = service.execution_parameters(&handle.execution_id).unwrap();
        assert_eq!(recorded.get("instance_count").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_upsert_records_tags() {
        let service = LocalPipelineService::new();
        let tags = vec![Tag {
            key: "team".to_string(),
            value: "ml-platform".to_string(),
        }];
        service
            .upsert("demo", serde_json::json!({}), &tags)
            .await
            .unwrap();
        assert_eq!(service.tags("demo").unwrap(), tags);
    }
}
