//! The backing-store side of the cache.

use crate::types::EntityId;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// Why a loader produced no object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The entity does not exist. Not a failure.
    #[error("not found")]
    NotFound,

    /// The backing store could not be read.
    #[error("load failed: {0}")]
    Failed(String),
}

impl LoadError {
    /// Wrap any displayable error as a failure.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        LoadError::Failed(reason.to_string())
    }
}

/// Reconstructs a domain object from the backing store.
#[async_trait]
pub trait Loader<T>: Send + Sync + 'static {
    /// Load `id`.
    async fn fetch(&self, id: &EntityId) -> Result<T, LoadError>;
}

/// Adapter turning an async closure into a [`Loader`].
///
/// ```rust,ignore
/// let loader = FnLoader::new(|id: EntityId| async move {
///     db.find_user(&id).await.map_err(LoadError::failed)?.ok_or(LoadError::NotFound)
/// });
/// ```
pub struct FnLoader<F> {
    fetch: F,
}

impl<F> FnLoader<F> {
    /// Wrap `fetch`.
    pub fn new(fetch: F) -> Self {
        Self { fetch }
    }
}

#[async_trait]
impl<T, F, Fut> Loader<T> for FnLoader<F>
where
    T: Send + 'static,
    F: Fn(EntityId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, LoadError>> + Send + 'static,
{
    async fn fetch(&self, id: &EntityId) -> Result<T, LoadError> {
        (self.fetch)(id.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_loader() {
        let loader = FnLoader::new(|id: EntityId| async move {
            match id.as_str() {
                "user#42" => Ok("alice".to_string()),
                "user#500" => Err(LoadError::failed("connection reset")),
                _ => Err(LoadError::NotFound),
            }
        });

        assert_eq!(loader.fetch(&EntityId::from("user#42")).await.unwrap(), "alice");
        assert_eq!(
            loader.fetch(&EntityId::from("user#7")).await.unwrap_err(),
            LoadError::NotFound
        );
        assert_eq!(
            loader.fetch(&EntityId::from("user#500")).await.unwrap_err().to_string(),
            "load failed: connection reset"
        );
    }
}
