//! User generator callbacks and the record they run against.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use streamforge_core::MessageId;
use streamforge_streams::StreamStore;

/// Failure raised by (or on behalf of) user generator code.
///
/// The driving worker leaves the message unacknowledged on any of these, so
/// the log redelivers it; a fixed model or a recovered collaborator makes
/// the retry succeed.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("missing dependency {0:?}")]
    MissingDependency(String),

    #[error("dependency {name:?} has unexpected type: {value}")]
    WrongType { name: String, value: Value },

    #[error("generator failed: {0}")]
    Failed(String),
}

impl GeneratorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// The materialized dependency record a generator runs against: one decoded
/// value per declared parameter (historical parameters see arrays).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepRecord(BTreeMap<String, Value>);

impl DepRecord {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self(values)
    }

    pub fn value(&self, name: &str) -> Result<&Value, GeneratorError> {
        self.0
            .get(name)
            .ok_or_else(|| GeneratorError::MissingDependency(name.to_owned()))
    }

    pub fn f64(&self, name: &str) -> Result<f64, GeneratorError> {
        let value = self.value(name)?;
        value.as_f64().ok_or_else(|| GeneratorError::WrongType {
            name: name.to_owned(),
            value: value.clone(),
        })
    }

    pub fn i64(&self, name: &str) -> Result<i64, GeneratorError> {
        let value = self.value(name)?;
        value.as_i64().ok_or_else(|| GeneratorError::WrongType {
            name: name.to_owned(),
            value: value.clone(),
        })
    }

    pub fn bool(&self, name: &str) -> Result<bool, GeneratorError> {
        let value = self.value(name)?;
        value.as_bool().ok_or_else(|| GeneratorError::WrongType {
            name: name.to_owned(),
            value: value.clone(),
        })
    }

    pub fn text(&self, name: &str) -> Result<&str, GeneratorError> {
        let value = self.value(name)?;
        value.as_str().ok_or_else(|| GeneratorError::WrongType {
            name: name.to_owned(),
            value: value.clone(),
        })
    }

    /// A historical parameter: the last `history_length` values, oldest
    /// first, with `null` where no message existed yet.
    pub fn history(&self, name: &str) -> Result<&[Value], GeneratorError> {
        let value = self.value(name)?;
        value
            .as_array()
            .map(Vec::as_slice)
            .ok_or_else(|| GeneratorError::WrongType {
                name: name.to_owned(),
                value: value.clone(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Everything a generator invocation can see.
pub struct GeneratorContext {
    /// Identity of the message being derived.
    pub message_id: MessageId,
    /// Decoded dependency values.
    pub deps: DepRecord,
    /// Live store handle, present only when the field declares
    /// store-handle parameters.
    pub store: Option<Arc<dyn StreamStore>>,
}

impl GeneratorContext {
    /// The injected store handle; erroring when the model did not ask for
    /// one keeps the dependency explicit.
    pub fn store(&self) -> Result<&Arc<dyn StreamStore>, GeneratorError> {
        self.store
            .as_ref()
            .ok_or_else(|| GeneratorError::failed("field does not declare a store-handle parameter"))
    }
}

type CooperativeFuture = Pin<Box<dyn Future<Output = Result<Value, GeneratorError>> + Send>>;

/// A user generator.
///
/// Cooperative generators suspend on store calls and their own awaits;
/// blocking generators run on the harness thread pool. The flavor is data on
/// the declaration, not a type distinction, so the compiler and harness can
/// treat every field uniformly.
#[derive(Clone)]
pub enum GeneratorFn {
    Cooperative(Arc<dyn Fn(GeneratorContext) -> CooperativeFuture + Send + Sync>),
    Blocking(Arc<dyn Fn(GeneratorContext) -> Result<Value, GeneratorError> + Send + Sync>),
}

impl GeneratorFn {
    pub fn cooperative<F, Fut>(f: F) -> Self
    where
        F: Fn(GeneratorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, GeneratorError>> + Send + 'static,
    {
        Self::Cooperative(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(GeneratorContext) -> Result<Value, GeneratorError> + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Blocking(_))
    }
}

impl fmt::Debug for GeneratorFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooperative(_) => f.write_str("GeneratorFn::Cooperative"),
            Self::Blocking(_) => f.write_str("GeneratorFn::Blocking"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record() -> DepRecord {
        DepRecord::new(
            [
                ("lat".to_owned(), json!(52.2)),
                ("line".to_owned(), json!("119")),
                ("lat_history".to_owned(), json!([null, 52.1])),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[test]
    fn typed_accessors() {
        let record = record();
        assert_eq!(record.f64("lat").unwrap(), 52.2);
        assert_eq!(record.text("line").unwrap(), "119");
        assert_eq!(record.history("lat_history").unwrap().len(), 2);
    }

    #[test]
    fn missing_and_mistyped_dependencies_are_distinct() {
        let record = record();
        assert!(matches!(
            record.f64("lon"),
            Err(GeneratorError::MissingDependency(_))
        ));
        assert!(matches!(
            record.f64("line"),
            Err(GeneratorError::WrongType { .. })
        ));
    }
}
