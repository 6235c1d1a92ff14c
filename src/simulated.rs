//! Simulated pulsed-laser energy meter.
//!
//! Exercises every part of the engine without hardware: a constant serial
//! number, bounded and cropped numeric settings, a structured trigger setting,
//! read-only measurement results, a class-wide error table, positional action
//! arguments and a five-state lifecycle:
//!
//! ```text
//! DISCONNECTED --connect--> ON --start_acquisition--> MEASURING
//!                           ^ |                          |
//!                           | +--measure (sync burst)    |
//!                           +-------stop_acquisition-----+
//! FAULT / ALARM --reset--> ON
//! ```
//!
//! While `MEASURING`, a background thread produces one pulse per sample
//! interval and publishes it on `data_point_event` (alias `data-point-event`),
//! plus a `statistics_event` every ten pulses.

use rand::Rng;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::action::ActionDescriptor;
use crate::error::{RemoteError, RemoteResult};
use crate::event::EventDescriptor;
use crate::property::PropertyDescriptor;
use crate::schema::{NumericBounds, Schema};
use crate::state_machine::StateMachine;
use crate::thing::{Thing, ThingContext, ThingType};

/// Type name of the simulated meter.
pub const ENERGY_METER_TYPE: &str = "energy_meter";

const ENERGY_LOG_LEN: usize = 100;
const STATISTICS_EVERY: u64 = 10;

fn trigger_schema() -> RemoteResult<Schema> {
    Schema::from_json(&json!({
        "type": "object",
        "properties": {
            "mode": {"type": "string", "enum": ["internal", "external"]},
            "level": {"type": "number", "minimum": 0.0, "maximum": 5.0},
            "edge": {"type": "string", "enum": ["rising", "falling"]}
        },
        "required": ["mode"]
    }))
}

/// Define the energy meter type. One type can back any number of meters.
pub fn energy_meter_type() -> RemoteResult<Arc<ThingType>> {
    ThingType::builder(ENERGY_METER_TYPE)
        .doc("simulated pyroelectric energy meter")
        .property(
            PropertyDescriptor::builder("serial_number")
                .doc("serial number of the measurement head, settable once")
                .schema(Schema::string())
                .allow_none()
                .constant()
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("wavelength")
                .doc("calibration wavelength")
                .unit("nm")
                .schema(Schema::number())
                .bounds(NumericBounds::new(190.0, 25000.0))
                .default(json!(1064.0))
                .observable()
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("integration_time")
                .doc("integration window per pulse")
                .unit("ms")
                .schema(Schema::integer())
                .bounds(NumericBounds::new(1.0, 1000.0))
                .crop_to_bounds()
                .default(json!(100))
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("trigger")
                .doc("trigger configuration")
                .schema(trigger_schema()?)
                .default(json!({"mode": "internal", "level": 0.5}))
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("last_energy")
                .doc("energy of the most recent pulse")
                .unit("J")
                .schema(Schema::number())
                .allow_none()
                .readonly()
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("energy_log")
                .doc("most recent pulse energies")
                .schema(Schema::array_of(Schema::number()))
                .default(json!([]))
                .readonly()
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("statistics")
                .doc("count, mean and max of the logged pulses")
                .readonly()
                .getter(|ctx| statistics(&ctx.property("energy_log")?))
                .build()?,
        )
        .property(
            PropertyDescriptor::builder("error_codes")
                .doc("error table shared by every meter")
                .default(json!({"E01": "sensor saturated", "E02": "head disconnected"}))
                .readonly()
                .class_member()
                .build()?,
        )
        .action(
            ActionDescriptor::new("connect", connect)
                .doc("open the measurement head")
                .parameters(["serial_number"])
                .input_schema(Schema::object().field("serial_number", Schema::string(), false)),
        )
        .action(
            ActionDescriptor::new("disconnect", |ctx, _| {
                ctx.set_state("DISCONNECTED")?;
                Ok(Value::Null)
            })
            .doc("close the measurement head")
            .states(["ON", "MEASURING", "FAULT", "ALARM"]),
        )
        .action(
            ActionDescriptor::new("start_acquisition", |ctx, _| {
                ctx.set_state("MEASURING")?;
                Ok(Value::Null)
            })
            .doc("start continuous acquisition"),
        )
        .action(
            ActionDescriptor::new("stop_acquisition", |ctx, _| {
                ctx.set_state("ON")?;
                Ok(Value::Null)
            })
            .doc("stop continuous acquisition")
            .states(["FAULT", "ALARM"]),
        )
        .action(
            ActionDescriptor::new("measure", measure)
                .doc("acquire a burst of pulses and return their energies")
                .parameters(["samples"])
                .input_schema(Schema::object().field(
                    "samples",
                    Schema::integer().with_bounds(NumericBounds::new(1.0, 1000.0)),
                    false,
                ))
                .output_schema(Schema::array_of(Schema::number()))
                .oneway_eligible(false),
        )
        .action(
            ActionDescriptor::new("reset", |ctx, _| {
                ctx.set_state("ON")?;
                Ok(Value::Null)
            })
            .doc("clear a fault or alarm")
            .states(["FAULT", "ALARM"]),
        )
        .event(
            EventDescriptor::new("data_point_event")
                .alias("data-point-event")
                .doc("one pulse")
                .schema(
                    Schema::object()
                        .field("timestamp", Schema::number(), true)
                        .field("energy", Schema::number(), true),
                ),
        )
        .event(EventDescriptor::new("statistics_event").doc("running statistics"))
        .state_machine(
            StateMachine::new(["DISCONNECTED", "ON", "MEASURING", "FAULT", "ALARM"], "DISCONNECTED")
                .allow("DISCONNECTED", ["connect", "serial_number"])
                .allow("ON", ["start_acquisition", "measure", "trigger"])
                .allow("MEASURING", ["stop_acquisition"])
                .push_state_change_event(true),
        )
        .build()
}

fn connect(ctx: &mut ThingContext<'_>, args: Value) -> anyhow::Result<Value> {
    if let Some(serial) = args.get("serial_number").filter(|v| !v.is_null()) {
        if ctx.property("serial_number")?.is_null() {
            ctx.write_property("serial_number", serial.clone())?;
        }
    }
    let serial = ctx.property("serial_number")?;
    if serial.is_null() {
        anyhow::bail!("no serial number given and none configured");
    }
    tracing::info!("{}: connected to head {}", ctx.thing_id(), serial);
    ctx.set_state("ON")?;
    Ok(Value::Null)
}

fn measure(ctx: &mut ThingContext<'_>, args: Value) -> anyhow::Result<Value> {
    let samples = args.get("samples").and_then(Value::as_u64).unwrap_or(1);
    let mut energies = Vec::new();
    for _ in 0..samples {
        energies.push(record_pulse(ctx)?);
    }
    Ok(json!(energies))
}

fn simulate_pulse(integration_ms: f64) -> f64 {
    let mut rng = rand::thread_rng();
    1.0e-3 * (integration_ms / 100.0) * rng.gen_range(0.9..1.1)
}

fn record_pulse(ctx: &mut ThingContext<'_>) -> RemoteResult<f64> {
    let integration = ctx.property("integration_time")?.as_f64().unwrap_or(100.0);
    let energy = simulate_pulse(integration);

    let mut log = match ctx.property("energy_log")? {
        Value::Array(values) => values,
        _ => Vec::new(),
    };
    log.push(json!(energy));
    if log.len() > ENERGY_LOG_LEN {
        let excess = log.len() - ENERGY_LOG_LEN;
        log.drain(..excess);
    }
    ctx.write_property("energy_log", Value::Array(log))?;
    ctx.write_property("last_energy", json!(energy))?;
    Ok(energy)
}

fn statistics(log: &Value) -> anyhow::Result<Value> {
    let energies: Vec<f64> = log
        .as_array()
        .map(|values| values.iter().filter_map(Value::as_f64).collect())
        .unwrap_or_default();
    if energies.is_empty() {
        return Ok(json!({"count": 0, "mean": null, "max": null}));
    }
    let mean = energies.iter().sum::<f64>() / energies.len() as f64;
    let max = energies.iter().cloned().fold(f64::MIN, f64::max);
    Ok(json!({"count": energies.len(), "mean": mean, "max": max}))
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Create a meter and start its acquisition thread.
///
/// The thread exits once the last `Arc<Thing>` is dropped.
pub fn spawn_energy_meter(
    id: impl Into<String>,
    thing_type: Arc<ThingType>,
    sample_interval: Duration,
) -> RemoteResult<Arc<Thing>> {
    let thing = Thing::new(id, thing_type);
    let weak = Arc::downgrade(&thing);
    std::thread::Builder::new()
        .name(format!("acquisition-{}", thing.id()))
        .spawn(move || acquisition_loop(weak, sample_interval))
        .map_err(|e| RemoteError::Execution(format!("failed to start acquisition thread: {}", e)))?;
    Ok(thing)
}

fn acquisition_loop(thing: Weak<Thing>, interval: Duration) {
    let mut pulses: u64 = 0;
    loop {
        std::thread::sleep(interval);
        let Some(thing) = thing.upgrade() else {
            break;
        };

        let sample = thing.with_context(|ctx| {
            if ctx.state() != Some("MEASURING") {
                return Ok(None);
            }
            let energy = record_pulse(ctx)?;
            let stats = statistics(&ctx.property("energy_log")?).map_err(RemoteError::from_handler)?;
            Ok::<_, RemoteError>(Some((energy, stats)))
        });

        match sample {
            Ok(Some((energy, stats))) => {
                pulses += 1;
                let point = json!({"timestamp": unix_seconds(), "energy": energy});
                if let Err(e) = thing.emit("data_point_event", point) {
                    tracing::warn!("{}: failed to publish pulse: {}", thing.id(), e);
                }
                if pulses % STATISTICS_EVERY == 0 {
                    if let Err(e) = thing.emit("statistics_event", stats) {
                        tracing::warn!("{}: failed to publish statistics: {}", thing.id(), e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("{}: acquisition failed: {}", thing.id(), e),
        }
    }
    tracing::debug!("acquisition thread exiting");
}
