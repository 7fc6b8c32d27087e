//! Named processor factories available to a worker executable.

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::dispatch::{Bound, Dispatch, Processor};

type Factory = Box<dyn Fn(Value) -> anyhow::Result<Box<dyn Dispatch>>>;

/// Factories the worker can build a processor from, keyed by name.
///
/// The broker selects one by name in its `Init` message and supplies the
/// factory arguments as JSON.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: FxHashMap<String, Factory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. `A` is decoded from the JSON factory arguments;
    /// use `()` for factories without arguments.
    pub fn register<P, A, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        P: Processor,
        A: DeserializeOwned,
        F: Fn(A) -> anyhow::Result<P> + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let build = move |raw: Value| -> anyhow::Result<Box<dyn Dispatch>> {
            let args: A = serde_json::from_value(raw).map_err(|e| {
                anyhow::anyhow!("invalid arguments for factory '{}': {}", label, e)
            })?;
            let processor = factory(args)?;
            Ok(Box::new(Bound::new(processor)))
        };
        self.factories.insert(name, Box::new(build));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered factory names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the processor registered under `name`.
    pub fn build(&self, name: &str, args: Value) -> anyhow::Result<Box<dyn Dispatch>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown processor factory '{}' (available: {})",
                name,
                self.names().join(", ")
            )
        })?;
        factory(args)
    }
}
