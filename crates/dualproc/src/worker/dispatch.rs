//! Operation dispatch tables for processors.

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{ArgumentError, CallArgs, Failure, FailureKind};

/// A stateful computation object hosted by the worker process.
///
/// Implementors expose their callable surface as an [`Operations`] table.
/// Operations run one at a time on the worker's only thread, so `&mut self`
/// access needs no further synchronization.
///
/// The worker's stdout is the IPC channel: operations must not print to it.
/// Use `tracing` (which writes to stderr) for diagnostics.
pub trait Processor: Sized + 'static {
    /// The operations callable on this processor, keyed by name.
    fn operations() -> Operations<Self>;
}

type Handler<T> = Box<dyn Fn(&mut T, &CallArgs) -> Result<Value, Failure>>;

/// Mapping from operation name to handler for processor type `T`.
pub struct Operations<T> {
    handlers: FxHashMap<String, Handler<T>>,
}

impl<T> Default for Operations<T> {
    fn default() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }
}

impl<T> Operations<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    ///
    /// The handler's return value is converted to JSON. Errors are reported
    /// as [`FailureKind::InvalidArguments`] when they are an [`ArgumentError`]
    /// and as [`FailureKind::OperationFailed`] otherwise.
    pub fn register<R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        T: 'static,
        R: Serialize,
        F: Fn(&mut T, &CallArgs) -> anyhow::Result<R> + 'static,
    {
        let wrapped = move |target: &mut T, args: &CallArgs| -> Result<Value, Failure> {
            let returned = handler(target, args).map_err(classify)?;
            serde_json::to_value(returned).map_err(|e| {
                Failure::new(
                    FailureKind::Encoding,
                    format!("return value could not be encoded: {}", e),
                )
            })
        };
        self.handlers.insert(name.into(), Box::new(wrapped));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve `operation` and run it against `target`.
    pub fn dispatch(
        &self,
        target: &mut T,
        operation: &str,
        args: &CallArgs,
    ) -> Result<Value, Failure> {
        match self.handlers.get(operation) {
            Some(handler) => handler(target, args),
            None => Err(Failure::new(
                FailureKind::OperationNotFound,
                format!("no operation named '{}'", operation),
            )),
        }
    }
}

fn classify(err: anyhow::Error) -> Failure {
    let kind = if err.downcast_ref::<ArgumentError>().is_some() {
        FailureKind::InvalidArguments
    } else {
        FailureKind::OperationFailed
    };
    Failure::new(kind, format!("{:#}", err))
}

/// Type-erased processor together with its dispatch table.
pub trait Dispatch {
    fn dispatch(&mut self, operation: &str, args: &CallArgs) -> Result<Value, Failure>;
}

/// A processor instance bound to its operations.
pub(crate) struct Bound<T> {
    target: T,
    operations: Operations<T>,
}

impl<T: Processor> Bound<T> {
    pub(crate) fn new(target: T) -> Self {
        Self {
            target,
            operations: T::operations(),
        }
    }
}

impl<T> Dispatch for Bound<T> {
    fn dispatch(&mut self, operation: &str, args: &CallArgs) -> Result<Value, Failure> {
        self.operations.dispatch(&mut self.target, operation, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallEnvelope;
    use serde_json::json;

    struct Accumulator {
        total: i64,
    }

    impl Processor for Accumulator {
        fn operations() -> Operations<Self> {
            Operations::new()
                .register("add", |acc: &mut Self, args: &CallArgs| {
                    let n: i64 = args.get(0, "n")?;
                    acc.total += n;
                    Ok(acc.total)
                })
                .register("fail", |_: &mut Self, _: &CallArgs| -> anyhow::Result<()> {
                    anyhow::bail!("refused")
                })
        }
    }

    fn args(call: CallEnvelope) -> CallArgs {
        call.args().clone()
    }

    #[test]
    fn test_dispatch_keeps_state() {
        let mut bound = Bound::new(Accumulator { total: 0 });
        let add = args(CallEnvelope::new("add").arg(2));

        assert_eq!(bound.dispatch("add", &add).unwrap(), json!(2));
        assert_eq!(bound.dispatch("add", &add).unwrap(), json!(4));
    }

    #[test]
    fn test_unknown_operation() {
        let mut bound = Bound::new(Accumulator { total: 0 });
        let failure = bound.dispatch("missing_method", &CallArgs::new()).unwrap_err();

        assert_eq!(failure.kind, FailureKind::OperationNotFound);
        assert!(failure.message.contains("missing_method"));
    }

    #[test]
    fn test_error_classification() {
        let mut bound = Bound::new(Accumulator { total: 0 });

        let failure = bound.dispatch("add", &CallArgs::new()).unwrap_err();
        assert_eq!(failure.kind, FailureKind::InvalidArguments);

        let failure = bound.dispatch("fail", &CallArgs::new()).unwrap_err();
        assert_eq!(failure.kind, FailureKind::OperationFailed);
        assert_eq!(failure.message, "refused");
    }

    #[test]
    fn test_names_sorted() {
        let ops = Accumulator::operations();
        assert_eq!(ops.names(), vec!["add", "fail"]);
        assert!(ops.contains("add"));
        assert!(!ops.contains("sub"));
    }
}
