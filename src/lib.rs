//! Per-request batching for the agent trace GraphQL layer: an implementation
//! of the [dataloader pattern](https://github.com/graphql/dataloader). Many
//! independent resolvers each ask for one entity by id; the loaders collect
//! the ids asked for within a short window and hand them to the backing
//! service as a single batch, then give each resolver its own value.
//!
//! ## Overview
//!
//! The core is the generic [`BatchController`]. It is configured with a
//! [`BatchRules`]:
//! - `batcher` is called once per batch with the unique keys of that batch,
//!   and resolves to a map from key to value. A key it leaves out is handed
//!   to its waiters as `Value::default()`; that is how "not found" is
//!   expressed, so values are usually `Option<T>` or `Vec<T>`.
//! - `window` is how long a batch stays open after its first key.
//! - `max_keys` caps the number of distinct keys in a batch. A full batch
//!   is dispatched right away and the next key starts a new one.
//!
//! ```
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! use agenttrace_dataloader::{BatchController, BatchRules, RequestContext};
//! use futures::{executor::block_on, future};
//!
//! let controller = BatchController::new(BatchRules {
//!     batcher: |ids: Vec<u32>| async move {
//!         let found: HashMap<u32, String> = ids
//!             .into_iter()
//!             .filter(|id| id % 2 == 0)
//!             .map(|id| (id, format!("user-{}", id)))
//!             .collect();
//!         Ok::<_, String>(found)
//!     },
//!     window: Duration::from_millis(1),
//!     max_keys: None,
//! });
//!
//! let ctx = RequestContext::new();
//! let (even, odd) = block_on(future::join(
//!     controller.load_in(&ctx, 2),
//!     controller.load_in(&ctx, 3),
//! ));
//!
//! assert_eq!(even, Ok("user-2".to_string()));
//! assert_eq!(odd, Ok(String::new()));
//! ```
//!
//! On top of that sit the typed loaders. An [`EntityLoader`] binds a
//! controller to one entity and to a domain-service call, and [`Loaders`]
//! holds one of each for the duration of a request. A [`RequestScope`]
//! pairs them with the request's [`RequestContext`].
//!
//! ## Design notes
//!
//! ### Keys and values
//!
//! Keys are de-duplicated inside a batch: the batch function sees each
//! distinct key once, and the value is cloned for every additional caller
//! of the same key. In the common case of no duplicates, nothing is cloned.
//!
//! ### Poll-driven design
//!
//! Nothing is spawned. The batch function is driven in the foreground by
//! polling the futures returned by [`BatchController::load`], and only one
//! of them, the most recently polled, is woken to drive the shared batch.
//! The others are woken when the values are ready, or when the driver is
//! dropped and one of them has to take over.
//!
//! ### Cancellation
//!
//! Dropping a load future withdraws the caller from its batch. A key with
//! no callers left is not fetched (or, if the fetch is already running, its
//! value is discarded). The loads made through a [`RequestContext`] are
//! dropped this way when the context is cancelled or its deadline passes,
//! without affecting anyone else in the batch.

mod batch;
mod config;
mod context;
mod data;
pub mod domain;
mod error;
mod facade;
mod loaders;
pub mod service;
mod wakerset;

pub use batch::{BatchController, BatchFuture, BatchRules, LoadAll};
pub use config::{LoaderConfig, ENV_BATCH_WINDOW_MS, ENV_LIST_LIMIT, ENV_MAX_BATCH_SIZE};
pub use context::RequestContext;
pub use domain::TraceKey;
pub use error::{ConfigError, LoadError};
pub use facade::{per_key, EntityLoader, EntityResult, FetchFuture, Fetcher};
pub use loaders::{
    DatasetItemsLoader, DatasetLoader, DatasetRunsLoader, EvaluatorLoader, Loaders,
    ObservationsLoader, OrganizationLoader, ProjectLoader, PromptLoader, PromptVersionsLoader,
    RequestScope, ScoresLoader, Services, TraceLoader, UserLoader,
};
pub use service::{ServiceError, ServiceResult};
