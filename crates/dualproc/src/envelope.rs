//! Call and result envelopes exchanged with the worker process.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique identifier correlating a call with its result.
///
/// Keys are random v4 UUIDs, so envelopes built concurrently on any thread
/// never collide and no shared counter is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallKey(Uuid);

impl CallKey {
    /// Generate a fresh key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CallKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for CallKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Positional and named arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments, in order.
    #[serde(default)]
    pub positional: Vec<Value>,
    /// Named arguments.
    #[serde(default)]
    pub named: Map<String, Value>,
}

/// An argument could not be extracted from [`CallArgs`].
#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    /// No positional argument at `index` and no named argument `name`.
    #[error("missing argument '{name}' (position {index})")]
    Missing { index: usize, name: String },

    /// No named argument with this name.
    #[error("missing named argument '{0}'")]
    MissingNamed(String),

    /// The argument was present but did not decode into the requested type.
    #[error("invalid argument '{name}': {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CallArgs {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of arguments, positional and named together.
    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    /// True when there are neither positional nor named arguments.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Decode the named argument `name`.
    pub fn get_named<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgumentError> {
        let value = self
            .named
            .get(name)
            .ok_or_else(|| ArgumentError::MissingNamed(name.to_string()))?;
        decode(name, value)
    }

    /// Decode a parameter passed either at position `index` or by `name`.
    ///
    /// The named form wins when both are present.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ArgumentError> {
        match self.lookup(index, name) {
            Some(value) => decode(name, value),
            None => Err(ArgumentError::Missing {
                index,
                name: name.to_string(),
            }),
        }
    }

    /// Like [`get`](Self::get), but an absent parameter yields `None`.
    pub fn get_opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, ArgumentError> {
        self.lookup(index, name).map(|v| decode(name, v)).transpose()
    }

    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.named.get(name).or_else(|| self.positional.get(index))
    }
}

fn decode<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, ArgumentError> {
    T::deserialize(value).map_err(|source| ArgumentError::Invalid {
        name: name.to_string(),
        source,
    })
}

/// A request to invoke one operation on the worker's processor.
///
/// The key is assigned at construction and never changes. A broker accepts
/// each key once; submitting a clone of an envelope is refused.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    key: CallKey,
    operation: String,
    args: CallArgs,
}

impl CallEnvelope {
    /// New call to `operation` with no arguments.
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_args(operation, CallArgs::new())
    }

    /// New call to `operation` with a prepared argument list.
    pub fn with_args(operation: impl Into<String>, args: CallArgs) -> Self {
        Self {
            key: CallKey::new(),
            operation: operation.into(),
            args,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.positional.push(value.into());
        self
    }

    /// Set a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.named.insert(name.into(), value.into());
        self
    }

    pub fn key(&self) -> CallKey {
        self.key
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }

    pub(crate) fn from_parts(key: CallKey, operation: String, args: CallArgs) -> Self {
        Self {
            key,
            operation,
            args,
        }
    }

    pub(crate) fn into_parts(self) -> (CallKey, String, CallArgs) {
        (self.key, self.operation, self.args)
    }
}

/// Category of a failed call.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub enum FailureKind {
    /// The processor has no operation with the requested name.
    OperationNotFound,
    /// The arguments did not match the operation's parameters.
    InvalidArguments,
    /// The operation returned an error.
    OperationFailed,
    /// The operation panicked. The worker recovered and keeps serving.
    Panicked,
    /// The return value could not be encoded for the channel.
    Encoding,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OperationNotFound => "operation not found",
            Self::InvalidArguments => "invalid arguments",
            Self::OperationFailed => "operation failed",
            Self::Panicked => "operation panicked",
            Self::Encoding => "encoding error",
        };
        f.write_str(s)
    }
}

/// Structured detail of a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

/// Outcome of one [`CallEnvelope`], correlated by key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEnvelope {
    /// Key of the originating call.
    pub key: CallKey,
    /// Return value, or the captured failure.
    pub outcome: Result<Value, Failure>,
}

impl ResultEnvelope {
    pub fn success(key: CallKey, value: Value) -> Self {
        Self {
            key,
            outcome: Ok(value),
        }
    }

    pub fn failure(key: CallKey, failure: Failure) -> Self {
        Self {
            key,
            outcome: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Return value, present only on success.
    pub fn value(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    /// Failure detail, present only on failure.
    pub fn failure_detail(&self) -> Option<&Failure> {
        self.outcome.as_ref().err()
    }

    /// Decode the return value into `T`.
    ///
    /// A value that does not decode is reported as an [`FailureKind::Encoding`]
    /// failure.
    pub fn decode<T: DeserializeOwned>(self) -> Result<T, Failure> {
        let value = self.outcome?;
        serde_json::from_value(value)
            .map_err(|e| Failure::new(FailureKind::Encoding, e.to_string()))
    }

    pub fn into_result(self) -> Result<Value, Failure> {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_unique_and_parse_back() {
        let a = CallKey::new();
        let b = CallKey::new();
        assert_ne!(a, b);

        let text = a.to_string();
        assert_eq!(text.len(), 36);
        assert_eq!(text.parse::<CallKey>().unwrap(), a);
    }

    #[test]
    fn test_builder_keeps_key() {
        let call = CallEnvelope::new("scale");
        let key = call.key();
        let call = call.arg(3).kwarg("factor", 2.5);

        assert_eq!(call.key(), key);
        assert_eq!(call.operation(), "scale");
        assert_eq!(call.args().positional, vec![json!(3)]);
        assert_eq!(call.args().named.get("factor"), Some(&json!(2.5)));
    }

    #[test]
    fn test_len_counts_named_arguments() {
        let named_only = CallEnvelope::new("op").kwarg("text", "x").args().clone();
        assert_eq!(named_only.len(), 1);
        assert!(!named_only.is_empty());

        let both = CallEnvelope::new("op").arg(1).arg(2).kwarg("k", 3).args().clone();
        assert_eq!(both.len(), 3);

        let none = CallArgs::new();
        assert_eq!(none.len(), 0);
        assert!(none.is_empty());
    }

    #[test]
    fn test_get_prefers_named() {
        let args = CallEnvelope::new("op")
            .arg("positional")
            .kwarg("text", "named")
            .args()
            .clone();

        let text: String = args.get(0, "text").unwrap();
        assert_eq!(text, "named");
    }

    #[test]
    fn test_get_falls_back_to_position() {
        let args = CallEnvelope::new("op").arg(7).args().clone();
        let n: u32 = args.get(0, "n").unwrap();
        assert_eq!(n, 7);
        assert!(args.get_opt::<u32>(1, "m").unwrap().is_none());
    }

    #[test]
    fn test_argument_errors() {
        let args = CallEnvelope::new("op").arg("not a number").args().clone();

        match args.get::<u32>(0, "n") {
            Err(ArgumentError::Invalid { name, .. }) => assert_eq!(name, "n"),
            other => panic!("expected invalid argument, got {:?}", other),
        }
        match args.get::<u32>(1, "m") {
            Err(ArgumentError::Missing { index, name }) => {
                assert_eq!(index, 1);
                assert_eq!(name, "m");
            }
            other => panic!("expected missing argument, got {:?}", other),
        }
        assert!(matches!(
            args.get_named::<u32>("n"),
            Err(ArgumentError::MissingNamed(_))
        ));
    }

    #[test]
    fn test_result_accessors() {
        let key = CallKey::new();
        let ok = ResultEnvelope::success(key, json!([1, 2]));
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&json!([1, 2])));
        assert!(ok.failure_detail().is_none());
        assert_eq!(ok.decode::<Vec<u8>>().unwrap(), vec![1, 2]);

        let err = ResultEnvelope::failure(key, Failure::new(FailureKind::OperationFailed, "boom"));
        assert!(!err.is_success());
        assert!(err.value().is_none());
        assert_eq!(
            err.failure_detail().unwrap().to_string(),
            "operation failed: boom"
        );
    }
}
