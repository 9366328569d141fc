//! Shared Kubernetes plumbing: optimistic-concurrency updates, single-object
//! watches, and synchronous deletion.

use std::fmt::Debug;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy};
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::{BACKOFF_BASE, BACKOFF_CAP};
use crate::error::Error;

/// Delay before the `attempt`-th retry of a transient orchestrator error.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(attempt))
}

/// Atomically apply an arbitrary modification to an object.
///
/// Works by reading and replacing the object, retrying on 409 Conflict
/// (the object's resourceVersion changed between read and replace). Use
/// when a patch cannot express the modification. Returns the resulting
/// object, or the unchanged object if the modifier made no changes.
pub async fn atomically_modify<K, F>(api: &Api<K>, name: &str, mut modifier: F) -> Result<K, Error>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize,
    F: FnMut(&mut K) -> Result<(), Error>,
{
    loop {
        let mut obj = api.get(name).await?;
        let original = serde_json::to_value(&obj)?;

        modifier(&mut obj)?;

        if serde_json::to_value(&obj)? == original {
            return Ok(obj);
        }

        match api.replace(name, &PostParams::default(), &obj).await {
            Ok(obj) => return Ok(obj),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(name, "conflict while replacing object, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Watch a single object until the callback produces a result.
///
/// The callback must be idempotent: it observes the current object first
/// and then every subsequent version, though intermediate updates may be
/// missed. Fails if the object is deleted while being watched.
pub async fn watch_until<K, T, F>(api: &Api<K>, name: &str, mut callback: F) -> Result<T, Error>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    F: FnMut(&K) -> Result<Option<T>, Error>,
{
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api.clone(), config).boxed();

    while let Some(event) = stream
        .try_next()
        .await
        .map_err(|e| Error::internal(format!("watch of {name} failed: {e}")))?
    {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                if let Some(result) = callback(&obj)? {
                    return Ok(result);
                }
            }
            watcher::Event::Delete(_) => {
                return Err(Error::internal(format!(
                    "object {name} was deleted while being watched"
                )));
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    Err(Error::internal(format!("watch of {name} ended unexpectedly")))
}

/// Delete a pod with foreground cascading deletion and wait until it is
/// gone. Succeeds immediately if the pod does not exist.
pub async fn synchronously_delete_pod(
    api: &Api<Pod>,
    name: &str,
) -> Result<(), Error> {
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };

    match api.delete(name, &params).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    while api.get_opt(name).await?.is_some() {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_starts_at_the_base_and_doubles() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn backoff_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(30));
    }
}
