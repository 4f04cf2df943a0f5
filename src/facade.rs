//! Typed loaders: a [`BatchController`] bound to one entity and to a batch
//! function built from a single-key domain-service call.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::hash::Hash;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::batch::{BatchController, BatchRules, LoadAll};
use crate::config::LoaderConfig;
use crate::context::RequestContext;
use crate::error::LoadError;
use crate::service::ServiceError;

pub type FetchFuture<K, V> = BoxFuture<'static, Result<HashMap<K, V>, ServiceError>>;

/// A batch function: all the keys of one batch in, the values that were
/// found out.
pub type Fetcher<K, V> = Box<dyn Fn(Vec<K>) -> FetchFuture<K, V> + Send + Sync>;

pub type EntityResult<V> = Result<V, LoadError<ServiceError>>;

/// One entity's loader. Resolvers call [`get`](EntityLoader::get) with a
/// single id; concurrent gets made through the same loader share batches.
pub struct EntityLoader<K: Eq + Hash, V> {
    entity: &'static str,
    controller: BatchController<K, V, ServiceError, FetchFuture<K, V>, Fetcher<K, V>>,
}

impl<K: Eq + Hash, V> Debug for EntityLoader<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLoader")
            .field("entity", &self.entity)
            .field("controller", &self.controller)
            .finish()
    }
}

impl<K, V> EntityLoader<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Default + Send + 'static,
{
    pub fn new(entity: &'static str, config: &LoaderConfig, fetcher: Fetcher<K, V>) -> Self {
        Self {
            entity,
            controller: BatchController::new(BatchRules {
                batcher: fetcher,
                window: config.batch_window(),
                max_keys: config.max_keys(),
            }),
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Fetch one entity. An id the service could not resolve comes back as
    /// `V::default()` (`None` or an empty list), not as an error.
    pub fn get<'c>(&self, ctx: &'c RequestContext, id: K) -> impl Future<Output = EntityResult<V>> + 'c {
        self.controller.load_in(ctx, id)
    }

    /// Fetch several entities, in the order of `ids`.
    pub fn get_all<'c>(
        &self,
        ctx: &'c RequestContext,
        ids: Vec<K>,
    ) -> impl Future<Output = LoadAll<V, LoadError<ServiceError>>> + 'c {
        self.controller.load_all(ctx, ids)
    }

    pub fn dispatch_pending(&self) {
        self.controller.dispatch_pending()
    }
}

/// Build a batch function out of a single-key lookup. The lookups of one
/// batch run concurrently.
///
/// A key whose lookup fails is logged and left out of the result, so its
/// callers see the default value and the other keys of the batch are not
/// affected. This holds for every [`ServiceError`], including
/// [`ServiceError::Unavailable`].
pub fn per_key<K, V, F, Fut>(entity: &'static str, lookup: F) -> Fetcher<K, V>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    V: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, ServiceError>> + Send + 'static,
{
    Box::new(move |keys: Vec<K>| {
        let lookups: Vec<_> = keys
            .into_iter()
            .map(|key| lookup(key.clone()).map(move |outcome| (key, outcome)))
            .collect();

        async move {
            let outcomes = future::join_all(lookups).await;
            let mut found = HashMap::with_capacity(outcomes.len());

            for (key, outcome) in outcomes {
                match outcome {
                    Ok(value) => {
                        found.insert(key, value);
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(entity, id = %key, "entity not found");
                    }
                    Err(err) => {
                        warn!(entity, id = %key, error = %err, "failed to load entity");
                    }
                }
            }

            Ok::<_, ServiceError>(found)
        }
        .boxed()
    })
}
