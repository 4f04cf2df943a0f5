//! The per-request loader container.
//!
//! A [`Loaders`] holds one [`EntityLoader`] per entity. Build one for every
//! inbound request and hand it (or the [`RequestScope`] that owns it) to the
//! resolvers of that request; batching never crosses requests.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::LoaderConfig;
use crate::context::RequestContext;
use crate::domain::{
    Dataset, DatasetItem, DatasetItemFilter, DatasetRun, Evaluator, Observation, Organization,
    Project, Prompt, PromptVersion, Score, Trace, TraceKey, User,
};
use crate::facade::{per_key, EntityLoader};
use crate::service::{
    AuthService, DatasetService, EvalService, OrgService, ProjectService, PromptService,
    QueryService, ScoreService,
};

pub type UserLoader = EntityLoader<Uuid, Option<Arc<User>>>;
pub type OrganizationLoader = EntityLoader<Uuid, Option<Arc<Organization>>>;
pub type ProjectLoader = EntityLoader<Uuid, Option<Arc<Project>>>;
pub type TraceLoader = EntityLoader<TraceKey, Option<Arc<Trace>>>;
pub type ObservationsLoader = EntityLoader<TraceKey, Vec<Arc<Observation>>>;
pub type ScoresLoader = EntityLoader<TraceKey, Vec<Arc<Score>>>;
pub type PromptLoader = EntityLoader<Uuid, Option<Arc<Prompt>>>;
pub type PromptVersionsLoader = EntityLoader<Uuid, Vec<Arc<PromptVersion>>>;
pub type DatasetLoader = EntityLoader<Uuid, Option<Arc<Dataset>>>;
pub type DatasetItemsLoader = EntityLoader<Uuid, Vec<Arc<DatasetItem>>>;
pub type DatasetRunsLoader = EntityLoader<Uuid, Vec<Arc<DatasetRun>>>;
pub type EvaluatorLoader = EntityLoader<Uuid, Option<Arc<Evaluator>>>;

fn shared<T>(items: Vec<T>) -> Vec<Arc<T>> {
    items.into_iter().map(Arc::new).collect()
}

impl UserLoader {
    pub fn users(service: Arc<dyn AuthService>, config: &LoaderConfig) -> Self {
        Self::new(
            "user",
            config,
            per_key("user", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get_user_by_id(id).await.map(|user| Some(Arc::new(user))) }
            }),
        )
    }
}

impl OrganizationLoader {
    pub fn organizations(service: Arc<dyn OrgService>, config: &LoaderConfig) -> Self {
        Self::new(
            "organization",
            config,
            per_key("organization", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get(id).await.map(|org| Some(Arc::new(org))) }
            }),
        )
    }
}

impl ProjectLoader {
    pub fn projects(service: Arc<dyn ProjectService>, config: &LoaderConfig) -> Self {
        Self::new(
            "project",
            config,
            per_key("project", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get(id).await.map(|project| Some(Arc::new(project))) }
            }),
        )
    }
}

impl TraceLoader {
    pub fn traces(service: Arc<dyn QueryService>, config: &LoaderConfig) -> Self {
        Self::new(
            "trace",
            config,
            per_key("trace", move |key: TraceKey| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .get_trace(key.project_id, &key.trace_id)
                        .await
                        .map(|trace| Some(Arc::new(trace)))
                }
            }),
        )
    }
}

impl ObservationsLoader {
    pub fn observations_by_trace(service: Arc<dyn QueryService>, config: &LoaderConfig) -> Self {
        Self::new(
            "observations",
            config,
            per_key("observations", move |key: TraceKey| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .get_observations_by_trace_id(key.project_id, &key.trace_id)
                        .await
                        .map(shared)
                }
            }),
        )
    }
}

impl ScoresLoader {
    pub fn scores_by_trace(service: Arc<dyn ScoreService>, config: &LoaderConfig) -> Self {
        Self::new(
            "scores",
            config,
            per_key("scores", move |key: TraceKey| {
                let service = Arc::clone(&service);
                async move {
                    service
                        .get_by_trace_id(key.project_id, &key.trace_id)
                        .await
                        .map(shared)
                }
            }),
        )
    }
}

impl PromptLoader {
    pub fn prompts(service: Arc<dyn PromptService>, config: &LoaderConfig) -> Self {
        Self::new(
            "prompt",
            config,
            per_key("prompt", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get(id).await.map(|prompt| Some(Arc::new(prompt))) }
            }),
        )
    }
}

impl PromptVersionsLoader {
    pub fn prompt_versions(service: Arc<dyn PromptService>, config: &LoaderConfig) -> Self {
        Self::new(
            "prompt_versions",
            config,
            per_key("prompt_versions", move |prompt_id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.list_versions(prompt_id).await.map(shared) }
            }),
        )
    }
}

impl DatasetLoader {
    pub fn datasets(service: Arc<dyn DatasetService>, config: &LoaderConfig) -> Self {
        Self::new(
            "dataset",
            config,
            per_key("dataset", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get(id).await.map(|dataset| Some(Arc::new(dataset))) }
            }),
        )
    }
}

impl DatasetItemsLoader {
    /// Items of each dataset, first page only (`config.list_limit` items).
    pub fn dataset_items(service: Arc<dyn DatasetService>, config: &LoaderConfig) -> Self {
        let limit = config.list_limit;

        Self::new(
            "dataset_items",
            config,
            per_key("dataset_items", move |dataset_id: Uuid| {
                let service = Arc::clone(&service);
                async move {
                    let filter = DatasetItemFilter::for_dataset(dataset_id);
                    let (items, _total) = service.list_items(&filter, limit, 0).await?;
                    Ok(shared(items))
                }
            }),
        )
    }
}

impl DatasetRunsLoader {
    /// Runs of each dataset, first page only (`config.list_limit` runs).
    pub fn dataset_runs(service: Arc<dyn DatasetService>, config: &LoaderConfig) -> Self {
        let limit = config.list_limit;

        Self::new(
            "dataset_runs",
            config,
            per_key("dataset_runs", move |dataset_id: Uuid| {
                let service = Arc::clone(&service);
                async move {
                    let (runs, _total) = service.list_runs(dataset_id, limit, 0).await?;
                    Ok(shared(runs))
                }
            }),
        )
    }
}

impl EvaluatorLoader {
    pub fn evaluators(service: Arc<dyn EvalService>, config: &LoaderConfig) -> Self {
        Self::new(
            "evaluator",
            config,
            per_key("evaluator", move |id: Uuid| {
                let service = Arc::clone(&service);
                async move { service.get(id).await.map(|evaluator| Some(Arc::new(evaluator))) }
            }),
        )
    }
}

/// Handles to the domain services. Built once and shared by every request.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<dyn AuthService>,
    pub orgs: Arc<dyn OrgService>,
    pub projects: Arc<dyn ProjectService>,
    pub query: Arc<dyn QueryService>,
    pub scores: Arc<dyn ScoreService>,
    pub prompts: Arc<dyn PromptService>,
    pub datasets: Arc<dyn DatasetService>,
    pub evals: Arc<dyn EvalService>,
}

/// One loader per entity, scoped to a single request.
///
/// Dropping the container dispatches any batch that is still open, so
/// callers still waiting on it are not left until its window expires.
#[derive(Debug)]
pub struct Loaders {
    pub user_by_id: UserLoader,
    pub organization_by_id: OrganizationLoader,
    pub project_by_id: ProjectLoader,
    pub trace_by_id: TraceLoader,
    pub observations_by_trace: ObservationsLoader,
    pub scores_by_trace: ScoresLoader,
    pub prompt_by_id: PromptLoader,
    pub prompt_versions_by_id: PromptVersionsLoader,
    pub dataset_by_id: DatasetLoader,
    pub dataset_items_by_id: DatasetItemsLoader,
    pub dataset_runs_by_id: DatasetRunsLoader,
    pub evaluator_by_id: EvaluatorLoader,
}

impl Loaders {
    pub fn new(services: &Services, config: &LoaderConfig) -> Self {
        Self {
            user_by_id: UserLoader::users(Arc::clone(&services.auth), config),
            organization_by_id: OrganizationLoader::organizations(
                Arc::clone(&services.orgs),
                config,
            ),
            project_by_id: ProjectLoader::projects(Arc::clone(&services.projects), config),
            trace_by_id: TraceLoader::traces(Arc::clone(&services.query), config),
            observations_by_trace: ObservationsLoader::observations_by_trace(
                Arc::clone(&services.query),
                config,
            ),
            scores_by_trace: ScoresLoader::scores_by_trace(Arc::clone(&services.scores), config),
            prompt_by_id: PromptLoader::prompts(Arc::clone(&services.prompts), config),
            prompt_versions_by_id: PromptVersionsLoader::prompt_versions(
                Arc::clone(&services.prompts),
                config,
            ),
            dataset_by_id: DatasetLoader::datasets(Arc::clone(&services.datasets), config),
            dataset_items_by_id: DatasetItemsLoader::dataset_items(
                Arc::clone(&services.datasets),
                config,
            ),
            dataset_runs_by_id: DatasetRunsLoader::dataset_runs(
                Arc::clone(&services.datasets),
                config,
            ),
            evaluator_by_id: EvaluatorLoader::evaluators(Arc::clone(&services.evals), config),
        }
    }

    /// Dispatch every loader's open batch without waiting for its window.
    pub fn dispatch_pending(&self) {
        self.user_by_id.dispatch_pending();
        self.organization_by_id.dispatch_pending();
        self.project_by_id.dispatch_pending();
        self.trace_by_id.dispatch_pending();
        self.observations_by_trace.dispatch_pending();
        self.scores_by_trace.dispatch_pending();
        self.prompt_by_id.dispatch_pending();
        self.prompt_versions_by_id.dispatch_pending();
        self.dataset_by_id.dispatch_pending();
        self.dataset_items_by_id.dispatch_pending();
        self.dataset_runs_by_id.dispatch_pending();
        self.evaluator_by_id.dispatch_pending();
    }
}

impl Drop for Loaders {
    fn drop(&mut self) {
        self.dispatch_pending();
    }
}

/// Everything a resolver needs for one request: the caller's context and
/// that request's loaders.
#[derive(Debug)]
pub struct RequestScope {
    ctx: RequestContext,
    loaders: Loaders,
}

impl RequestScope {
    pub fn new(services: &Services, config: &LoaderConfig, ctx: RequestContext) -> Self {
        Self {
            ctx,
            loaders: Loaders::new(services, config),
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn loaders(&self) -> &Loaders {
        &self.loaders
    }

    /// End the request. Open batches are dispatched for anyone still
    /// waiting on them; nothing of this scope outlives its last waiter.
    pub fn finish(self) {
        debug!("request scope finished; dispatching open batches");
        self.loaders.dispatch_pending();
    }
}
