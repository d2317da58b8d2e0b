//! The runtime registry: name → constructor.
//!
//! The table is seeded with the built-in runtimes on first use and is
//! otherwise written only during process initialization; steady-state
//! reads take the lock briefly and uncontended.

use crate::constants::BUILDKIT_NAME;
use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeAddrs, RuntimeConfig, RuntimePool};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// The future a runtime constructor returns.
pub type InitFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Runtime>>> + Send>>;

/// A runtime constructor.
pub type InitFn =
    fn(Arc<RuntimePool>, RuntimeAddrs, Option<serde_json::Value>) -> InitFuture;

static RUNTIMES: Lazy<RwLock<HashMap<String, InitFn>>> = Lazy::new(|| {
    let mut runtimes: HashMap<String, InitFn> = HashMap::new();
    runtimes.insert(BUILDKIT_NAME.to_string(), crate::buildkit::init);
    RwLock::new(runtimes)
});

/// Installs a runtime constructor under a name, replacing any previous
/// registration. Call during process initialization.
pub fn register_runtime(name: impl Into<String>, init: InitFn) {
    RUNTIMES
        .write()
        .expect("runtime registry poisoned")
        .insert(name.into(), init);
}

/// Initializes the runtime registered under the config's name.
pub async fn init(config: RuntimeConfig, pool: Arc<RuntimePool>) -> Result<Arc<dyn Runtime>> {
    let constructor = RUNTIMES
        .read()
        .expect("runtime registry poisoned")
        .get(&config.runtime)
        .copied()
        .ok_or(Error::UnknownRuntime {
            name: config.runtime.clone(),
        })?;

    constructor(pool, config.addrs, config.config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NullRecorder;

    #[tokio::test]
    async fn unknown_runtime_errors() {
        let config = RuntimeConfig {
            runtime: "warp-drive".to_string(),
            ..Default::default()
        };

        let err = match init(config, RuntimePool::new(Arc::new(NullRecorder))).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, Error::UnknownRuntime { .. }));
    }

    #[test]
    fn buildkit_is_registered_by_default() {
        assert!(RUNTIMES.read().unwrap().contains_key(BUILDKIT_NAME));
    }
}
