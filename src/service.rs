//! The domain services behind the loaders. Implementations live with the
//! storage layer; the loaders only call them, one key at a time.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Dataset, DatasetItem, DatasetItemFilter, DatasetRun, Evaluator, Observation, Organization,
    Project, Prompt, PromptVersion, Score, Trace, User,
};

/// Failure of a single domain-service call.
///
/// `Clone` so that one failed batch can hand the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The backing store could not be reached. Loaders log it and resolve
    /// the key to its default, like any other failed lookup.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound { .. })
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[async_trait]
pub trait AuthService: Send + Sync {
    async fn get_user_by_id(&self, id: Uuid) -> ServiceResult<User>;
}

#[async_trait]
pub trait OrgService: Send + Sync {
    async fn get(&self, id: Uuid) -> ServiceResult<Organization>;
}

#[async_trait]
pub trait ProjectService: Send + Sync {
    async fn get(&self, id: Uuid) -> ServiceResult<Project>;
}

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn get_trace(&self, project_id: Uuid, trace_id: &str) -> ServiceResult<Trace>;

    async fn get_observations_by_trace_id(
        &self,
        project_id: Uuid,
        trace_id: &str,
    ) -> ServiceResult<Vec<Observation>>;
}

#[async_trait]
pub trait ScoreService: Send + Sync {
    async fn get_by_trace_id(&self, project_id: Uuid, trace_id: &str) -> ServiceResult<Vec<Score>>;
}

#[async_trait]
pub trait PromptService: Send + Sync {
    async fn get(&self, id: Uuid) -> ServiceResult<Prompt>;

    async fn list_versions(&self, prompt_id: Uuid) -> ServiceResult<Vec<PromptVersion>>;
}

#[async_trait]
pub trait DatasetService: Send + Sync {
    async fn get(&self, id: Uuid) -> ServiceResult<Dataset>;

    /// One page of items and the total number of matching items.
    async fn list_items(
        &self,
        filter: &DatasetItemFilter,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<DatasetItem>, u64)>;

    /// One page of runs and the total number of runs of the dataset.
    async fn list_runs(
        &self,
        dataset_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> ServiceResult<(Vec<DatasetRun>, u64)>;
}

#[async_trait]
pub trait EvalService: Send + Sync {
    async fn get(&self, id: Uuid) -> ServiceResult<Evaluator>;
}
