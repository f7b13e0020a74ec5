//! Declarative model description.
//!
//! A `ModelSpec` is the static value handed to the compiler: which input
//! kinds exist, which artificial fields derive from them, and which output
//! reports gather them. Builders keep demo and test models readable; a
//! loader layer can construct the same values from any external format.

use std::collections::BTreeMap;

use crate::field::{FieldSource, FieldType};
use crate::generator::GeneratorFn;

/// One field of an input kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
}

/// An input kind: a stream of per-entity reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    /// Namespace of the input; names its raw and post-split streams.
    pub name: String,
    /// Field holding the entity identifier.
    pub id_field: String,
    pub fields: Vec<FieldSpec>,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: id_field.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            field_type,
        });
        self
    }
}

/// One declared dependency of an artificial field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepSpec {
    /// Generator parameter receiving the value.
    pub param: String,
    pub source: FieldSource,
    /// When set, the parameter receives the last `history_length` values of
    /// the source instead of the current one.
    pub history_length: Option<u64>,
}

impl DepSpec {
    pub fn current(param: impl Into<String>, source: FieldSource) -> Self {
        Self {
            param: param.into(),
            source,
            history_length: None,
        }
    }

    pub fn historical(param: impl Into<String>, source: FieldSource, length: u64) -> Self {
        Self {
            param: param.into(),
            source,
            history_length: Some(length),
        }
    }

    pub fn is_historical(&self) -> bool {
        self.history_length.is_some()
    }
}

/// A derived field: a generator over declared dependencies.
#[derive(Debug, Clone)]
pub struct ArtificialFieldSpec {
    pub name: String,
    pub generator: GeneratorFn,
    pub return_type: FieldType,
    pub deps: Vec<DepSpec>,
    /// Generator parameters injected with the live store handle.
    pub store_params: Vec<String>,
}

impl ArtificialFieldSpec {
    pub fn new(
        name: impl Into<String>,
        generator: GeneratorFn,
        return_type: FieldType,
    ) -> Self {
        Self {
            name: name.into(),
            generator,
            return_type,
            deps: Vec::new(),
            store_params: Vec::new(),
        }
    }

    pub fn with_dep(mut self, dep: DepSpec) -> Self {
        self.deps.push(dep);
        self
    }

    pub fn with_store_param(mut self, param: impl Into<String>) -> Self {
        self.store_params.push(param.into());
        self
    }
}

/// One gathered field of an output report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFieldSpec {
    pub dst_name: String,
    pub source: FieldSource,
}

/// An output report: a named subset of fields, emitted once every
/// contributor has arrived for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    pub fields: Vec<OutputFieldSpec>,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, dst_name: impl Into<String>, source: FieldSource) -> Self {
        self.fields.push(OutputFieldSpec {
            dst_name: dst_name.into(),
            source,
        });
        self
    }
}

/// The whole declared model.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub inputs: Vec<InputSpec>,
    pub artificial_fields: Vec<ArtificialFieldSpec>,
    pub outputs: Vec<OutputSpec>,
    /// Per consumer-group worker counts; groups not listed use the
    /// configured default.
    pub worker_config: BTreeMap<String, usize>,
}

impl ModelSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_artificial_field(mut self, field: ArtificialFieldSpec) -> Self {
        self.artificial_fields.push(field);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_workers(mut self, group: impl Into<String>, workers: usize) -> Self {
        self.worker_config.insert(group.into(), workers);
        self
    }
}
