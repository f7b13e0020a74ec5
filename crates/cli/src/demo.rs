//! Demo model: Warsaw public-transport vehicle telemetry.
//!
//! One input kind (per-vehicle position reports), two derived fields
//! (heading computed from the previous position, and a per-vehicle report
//! counter feeding on its own history), and three output reports.

use serde_json::{Value, json};

use streamforge_model::{
    ArtificialFieldSpec, DepSpec, FieldSource, FieldType, GeneratorContext, GeneratorError,
    GeneratorFn, InputSpec, ModelSpec, OutputSpec,
};

/// Heading in degrees from the previous position to the current one, or
/// null until a vehicle has reported twice.
async fn direction(ctx: GeneratorContext) -> Result<Value, GeneratorError> {
    let prev_lat = ctx.deps.history("lat_history")?[0].as_f64();
    let prev_lon = ctx.deps.history("lon_history")?[0].as_f64();
    let lat = ctx.deps.f64("lat")?;
    let lon = ctx.deps.f64("lon")?;
    Ok(match (prev_lat, prev_lon) {
        (Some(prev_lat), Some(prev_lon)) => {
            json!((lon - prev_lon).atan2(lat - prev_lat).to_degrees())
        }
        _ => Value::Null,
    })
}

/// Per-vehicle report counter: the previous value plus one, from zero.
async fn counter(ctx: GeneratorContext) -> Result<Value, GeneratorError> {
    let prev = ctx.deps.history("prev_values")?[0].as_i64().unwrap_or(-1);
    Ok(json!(prev + 1))
}

pub fn model() -> ModelSpec {
    ModelSpec::new()
        .with_input(
            InputSpec::new("ztm-report", "vehicle_number")
                .with_field("vehicle_number", FieldType::Integer)
                .with_field("time", FieldType::Text)
                .with_field("lat", FieldType::Float)
                .with_field("lon", FieldType::Float)
                .with_field("brigade", FieldType::Text)
                .with_field("line", FieldType::Text),
        )
        .with_artificial_field(
            ArtificialFieldSpec::new("direction", GeneratorFn::cooperative(direction), FieldType::Float)
                .with_dep(DepSpec::historical(
                    "lat_history",
                    FieldSource::input("ztm-report", "lat"),
                    1,
                ))
                .with_dep(DepSpec::historical(
                    "lon_history",
                    FieldSource::input("ztm-report", "lon"),
                    1,
                ))
                .with_dep(DepSpec::current("lat", FieldSource::input("ztm-report", "lat")))
                .with_dep(DepSpec::current("lon", FieldSource::input("ztm-report", "lon"))),
        )
        .with_artificial_field(
            ArtificialFieldSpec::new("counter", GeneratorFn::cooperative(counter), FieldType::Integer)
                .with_dep(DepSpec::historical(
                    "prev_values",
                    FieldSource::artificial("counter"),
                    1,
                ))
                .with_dep(DepSpec::current(
                    "time",
                    FieldSource::input("ztm-report", "time"),
                )),
        )
        .with_output(
            OutputSpec::new("location-report")
                .with_field("vehicle_number", FieldSource::input("ztm-report", "vehicle_number"))
                .with_field("lat", FieldSource::input("ztm-report", "lat"))
                .with_field("lon", FieldSource::input("ztm-report", "lon"))
                .with_field("line", FieldSource::input("ztm-report", "line"))
                .with_field("time", FieldSource::input("ztm-report", "time"))
                .with_field("brigade", FieldSource::input("ztm-report", "brigade")),
        )
        .with_output(
            OutputSpec::new("direction-report")
                .with_field("direction", FieldSource::artificial("direction")),
        )
        .with_output(
            OutputSpec::new("counter-report")
                .with_field("counter", FieldSource::artificial("counter")),
        )
}

#[cfg(test)]
mod tests {
    use streamforge_core::Config;
    use streamforge_model::compile;

    use super::*;

    #[test]
    fn demo_model_compiles() {
        let topology = compile(model(), &Config::default()).unwrap();
        // One splitter, two resolver/generator pairs, three report resolvers.
        assert_eq!(topology.stages.len(), 8);
        assert_eq!(
            topology.report_streams,
            vec![":location-report", ":direction-report", ":counter-report"]
        );
    }
}
