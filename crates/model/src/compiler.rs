//! Model compiler: from a declared model to a concrete stage topology.
//!
//! Compilation resolves every field reference (two passes, so forward and
//! self-references work), wires stream names, assigns consumer groups and
//! worker counts, and rejects defective models before anything runs:
//!
//! - one splitter per input kind (`:name` → `:name:split`);
//! - one resolver + one generator per artificial field
//!   (sources → `:F:deps` → `:artificial:F`);
//! - one resolver per output report (sources → `:R`).

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use streamforge_core::{Config, KeySpace};

use crate::error::ModelError;
use crate::field::{FieldSource, FieldType};
use crate::generator::GeneratorFn;
use crate::spec::{ArtificialFieldSpec, ModelSpec};

/// A wired dependency of a resolver: which stream and key feed which output
/// field of the joined record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub src_stream: String,
    pub src_key: String,
    pub dst_key: String,
    pub history_length: Option<u64>,
}

impl DependencySpec {
    pub fn is_historical(&self) -> bool {
        self.history_length.is_some()
    }
}

/// A splitter stage instance.
#[derive(Debug, Clone)]
pub struct SplitterSpec {
    pub group: String,
    pub input_stream: String,
    pub output_stream: String,
    pub object_id_field: String,
    pub workers: usize,
}

/// A dependency-resolver stage instance.
#[derive(Debug, Clone)]
pub struct ResolverSpec {
    pub group: String,
    pub dependencies: Vec<DependencySpec>,
    pub output_stream: String,
    pub workers: usize,
}

impl ResolverSpec {
    /// Distinct source streams, in declaration order.
    pub fn input_streams(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.dependencies
            .iter()
            .filter(|dep| seen.insert(dep.src_stream.clone()))
            .map(|dep| dep.src_stream.clone())
            .collect()
    }

    /// Number of non-historical contributors required for emission.
    pub fn num_dependencies(&self) -> u64 {
        self.dependencies
            .iter()
            .filter(|dep| !dep.is_historical())
            .count() as u64
    }
}

/// A generator dependency with its declared type, for payload validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorDep {
    pub param: String,
    pub field_type: FieldType,
    pub history_length: Option<u64>,
}

/// A field-generator stage instance.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    pub group: String,
    pub field_name: String,
    pub input_stream: String,
    pub output_stream: String,
    pub generator: GeneratorFn,
    pub return_type: FieldType,
    pub deps: Vec<GeneratorDep>,
    pub store_params: Vec<String>,
    pub workers: usize,
}

/// One stage of the compiled pipeline.
#[derive(Debug, Clone)]
pub enum StageSpec {
    Splitter(SplitterSpec),
    Resolver(ResolverSpec),
    Generator(GeneratorSpec),
}

impl StageSpec {
    pub fn group(&self) -> &str {
        match self {
            Self::Splitter(s) => &s.group,
            Self::Resolver(s) => &s.group,
            Self::Generator(s) => &s.group,
        }
    }

    pub fn workers(&self) -> usize {
        match self {
            Self::Splitter(s) => s.workers,
            Self::Resolver(s) => s.workers,
            Self::Generator(s) => s.workers,
        }
    }
}

/// The compiled pipeline: every stage instance plus its stream bindings.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub stages: Vec<StageSpec>,
    /// Terminal report streams, tailed by egress.
    pub report_streams: Vec<String>,
}

/// Compile a declared model against a configuration.
pub fn compile(model: ModelSpec, config: &Config) -> Result<Topology, ModelError> {
    let keyspace = KeySpace::new(config);
    let catalog = Catalog::build(&model)?;

    let mut stages = Vec::new();
    for input in &model.inputs {
        let group = format!("{}.split", input.name);
        stages.push(StageSpec::Splitter(SplitterSpec {
            group: group.clone(),
            input_stream: keyspace.input_stream(&input.name),
            output_stream: keyspace.split_stream(&input.name),
            object_id_field: input.id_field.clone(),
            workers: workers_for(&model, config, &group),
        }));
    }

    for field in &model.artificial_fields {
        let (resolver, generator) = compile_artificial_field(
            field, &model, config, &keyspace, &catalog,
        )?;
        stages.push(StageSpec::Resolver(resolver));
        stages.push(StageSpec::Generator(generator));
    }

    let mut report_streams = Vec::new();
    for output in &model.outputs {
        let group = format!("{}.report", output.name);
        let mut dependencies = Vec::new();
        let mut dst_names = BTreeSet::new();
        for field in &output.fields {
            if !dst_names.insert(field.dst_name.clone()) {
                return Err(ModelError::DuplicateParameter {
                    field: output.name.clone(),
                    param: field.dst_name.clone(),
                });
            }
            let (src_stream, _) = catalog.resolve(
                &field.source,
                &format!("output {:?}", output.name),
                &keyspace,
            )?;
            dependencies.push(DependencySpec {
                src_stream,
                src_key: field.source.source_key().to_owned(),
                dst_key: field.dst_name.clone(),
                history_length: None,
            });
        }
        let output_stream = keyspace.report_stream(&output.name);
        report_streams.push(output_stream.clone());
        stages.push(StageSpec::Resolver(ResolverSpec {
            group: group.clone(),
            dependencies,
            output_stream,
            workers: workers_for(&model, config, &group),
        }));
    }

    let mut groups = BTreeSet::new();
    for stage in &stages {
        if !groups.insert(stage.group().to_owned()) {
            return Err(ModelError::DuplicateGroup(stage.group().to_owned()));
        }
    }
    for group in model.worker_config.keys() {
        if !groups.contains(group) {
            return Err(ModelError::UnknownWorkerGroup(group.clone()));
        }
    }

    debug!(stages = stages.len(), "model compiled");
    Ok(Topology {
        stages,
        report_streams,
    })
}

fn compile_artificial_field(
    field: &ArtificialFieldSpec,
    model: &ModelSpec,
    config: &Config,
    keyspace: &KeySpace,
    catalog: &Catalog,
) -> Result<(ResolverSpec, GeneratorSpec), ModelError> {
    let context = format!("artificial field {:?}", field.name);

    let mut params = BTreeSet::new();
    let mut dependencies = Vec::new();
    let mut generator_deps = Vec::new();
    for dep in &field.deps {
        if !params.insert(dep.param.clone()) {
            return Err(ModelError::DuplicateParameter {
                field: field.name.clone(),
                param: dep.param.clone(),
            });
        }
        if dep.history_length == Some(0) {
            return Err(ModelError::EmptyHistory {
                field: field.name.clone(),
                param: dep.param.clone(),
            });
        }
        if let FieldSource::Artificial { field: target } = &dep.source {
            if *target == field.name && !dep.is_historical() {
                return Err(ModelError::SelfDependencyMustBeHistorical {
                    field: field.name.clone(),
                });
            }
        }
        let (src_stream, field_type) = catalog.resolve(&dep.source, &context, keyspace)?;
        dependencies.push(DependencySpec {
            src_stream,
            src_key: dep.source.source_key().to_owned(),
            dst_key: dep.param.clone(),
            history_length: dep.history_length,
        });
        generator_deps.push(GeneratorDep {
            param: dep.param.clone(),
            field_type,
            history_length: dep.history_length,
        });
    }
    for param in &field.store_params {
        if !params.insert(param.clone()) {
            return Err(ModelError::DuplicateParameter {
                field: field.name.clone(),
                param: param.clone(),
            });
        }
    }

    let deps_stream = keyspace.deps_stream(&field.name);
    let resolver_group = format!("{}.deps", field.name);
    let generator_group = format!("{}.generate", field.name);

    let resolver = ResolverSpec {
        group: resolver_group.clone(),
        dependencies,
        output_stream: deps_stream.clone(),
        workers: workers_for(model, config, &resolver_group),
    };
    let generator = GeneratorSpec {
        group: generator_group.clone(),
        field_name: field.name.clone(),
        input_stream: deps_stream,
        output_stream: keyspace.artificial_stream(&field.name),
        generator: field.generator.clone(),
        return_type: field.return_type,
        deps: generator_deps,
        store_params: field.store_params.clone(),
        workers: workers_for(model, config, &generator_group),
    };
    Ok((resolver, generator))
}

fn workers_for(model: &ModelSpec, config: &Config, group: &str) -> usize {
    model
        .worker_config
        .get(group)
        .copied()
        .unwrap_or(config.default_workers)
        .max(1)
}

/// Name catalog built in a first pass so that later references, forward
/// and self references included, resolve in the second.
struct Catalog {
    /// input name → (field name → type)
    inputs: BTreeMap<String, BTreeMap<String, FieldType>>,
    /// artificial field name → return type
    artificial: BTreeMap<String, FieldType>,
}

impl Catalog {
    fn build(model: &ModelSpec) -> Result<Self, ModelError> {
        let mut inputs = BTreeMap::new();
        for input in &model.inputs {
            let mut fields = BTreeMap::new();
            for field in &input.fields {
                fields.insert(field.name.clone(), field.field_type);
            }
            if !fields.contains_key(&input.id_field) {
                return Err(ModelError::MissingIdField {
                    input: input.name.clone(),
                    id_field: input.id_field.clone(),
                });
            }
            if inputs.insert(input.name.clone(), fields).is_some() {
                return Err(ModelError::DuplicateInput(input.name.clone()));
            }
        }

        let mut artificial = BTreeMap::new();
        for field in &model.artificial_fields {
            if artificial
                .insert(field.name.clone(), field.return_type)
                .is_some()
            {
                return Err(ModelError::DuplicateArtificialField(field.name.clone()));
            }
        }

        let mut outputs = BTreeSet::new();
        for output in &model.outputs {
            if !outputs.insert(output.name.clone()) {
                return Err(ModelError::DuplicateOutput(output.name.clone()));
            }
        }

        Ok(Self { inputs, artificial })
    }

    fn resolve(
        &self,
        source: &FieldSource,
        context: &str,
        keyspace: &KeySpace,
    ) -> Result<(String, FieldType), ModelError> {
        match source {
            FieldSource::Input { input, field } => {
                let field_type = self
                    .inputs
                    .get(input)
                    .and_then(|fields| fields.get(field))
                    .copied()
                    .ok_or_else(|| ModelError::UnknownReference {
                        context: context.to_owned(),
                        reference: format!("{input}.{field}"),
                    })?;
                Ok((keyspace.split_stream(input), field_type))
            }
            FieldSource::Artificial { field } => {
                let field_type = self.artificial.get(field).copied().ok_or_else(|| {
                    ModelError::UnknownReference {
                        context: context.to_owned(),
                        reference: field.clone(),
                    }
                })?;
                Ok((keyspace.artificial_stream(field), field_type))
            }
        }
    }
}
