//! Shared fixtures: a small motorized stage type and an in-memory
//! server/client pair.

#![allow(dead_code)]

use remote_daq::action::ActionDescriptor;
use remote_daq::client::{ClientConnection, ObjectProxy};
use remote_daq::config::{ClientSettings, ServerSettings};
use remote_daq::event::EventDescriptor;
use remote_daq::property::PropertyDescriptor;
use remote_daq::schema::{NumericBounds, Schema};
use remote_daq::server::Server;
use remote_daq::state_machine::StateMachine;
use remote_daq::thing::{Thing, ThingType};
use remote_daq::transport::memory;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const STAGE_ID: &str = "stage-1";

/// Linear stage with a DISABLED/IDLE lifecycle.
///
/// `position` and `speed` are writable only while IDLE; `position` crops to
/// its bounds, `speed` rejects out-of-range values.
pub fn stage_type() -> Arc<ThingType> {
    ThingType::builder("linear_stage")
        .doc("test stage")
        .property(
            PropertyDescriptor::builder("position")
                .unit("mm")
                .schema(Schema::number())
                .bounds(NumericBounds::new(0.0, 100.0))
                .crop_to_bounds()
                .default(json!(0.0))
                .observable()
                .build()
                .unwrap(),
        )
        .property(
            PropertyDescriptor::builder("speed")
                .unit("mm/s")
                .schema(Schema::number())
                .bounds(NumericBounds::new(1.0, 10.0))
                .default(json!(5.0))
                .build()
                .unwrap(),
        )
        .property(
            PropertyDescriptor::builder("serial")
                .schema(Schema::string())
                .allow_none()
                .constant()
                .build()
                .unwrap(),
        )
        .property(
            PropertyDescriptor::builder("status")
                .schema(Schema::string())
                .default(json!("idle"))
                .readonly()
                .build()
                .unwrap(),
        )
        .property(
            PropertyDescriptor::builder("label")
                .schema(Schema::string())
                .default(json!(""))
                .build()
                .unwrap(),
        )
        .action(ActionDescriptor::new("enable", |ctx, _| {
            ctx.set_state("IDLE")?;
            Ok(Value::Null)
        }))
        .action(
            ActionDescriptor::new("move_to", |ctx, args| {
                let target = args["target"].clone();
                ctx.write_property("position", target)?;
                let position = ctx.property("position")?;
                ctx.emit("moved_event", json!({ "position": position }))?;
                Ok(position)
            })
            .parameters(["target"])
            .input_schema(Schema::object().field("target", Schema::number(), true)),
        )
        .action(
            ActionDescriptor::new("sleep", |_, args| {
                let millis = args["millis"].as_u64().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(millis));
                Ok(json!(millis))
            })
            .parameters(["millis"]),
        )
        .action(ActionDescriptor::new("fail", |_, _| {
            anyhow::bail!("motor stalled")
        }))
        .action(
            ActionDescriptor::new("calibrate", |_, _| Ok(json!("calibrated"))).oneway_eligible(false),
        )
        .event(EventDescriptor::new("moved_event").alias("moved"))
        .state_machine(
            StateMachine::new(["DISABLED", "IDLE"], "DISABLED")
                .allow("DISABLED", ["enable"])
                .allow("IDLE", ["move_to", "position", "speed"])
                .push_state_change_event(true),
        )
        .build()
        .unwrap()
}

pub struct Harness {
    pub server: Arc<Server>,
    pub thing: Arc<Thing>,
    pub connection: ClientConnection,
}

impl Harness {
    pub fn proxy(&self) -> ObjectProxy {
        self.connection.proxy(STAGE_ID)
    }

    /// Another client connection to the same server.
    pub fn connect(&self, settings: ClientSettings) -> ClientConnection {
        let (server_end, client_end) = memory::pair();
        self.server.serve_connection(server_end);
        ClientConnection::new(client_end, settings)
    }
}

pub fn client_settings() -> ClientSettings {
    ClientSettings {
        invocation_timeout_ms: 2000,
        ..ClientSettings::default()
    }
}

/// Host one stage and connect to it over an in-memory transport.
pub fn start() -> Harness {
    start_with(client_settings())
}

pub fn start_with(settings: ClientSettings) -> Harness {
    let server = Server::new(ServerSettings::default());
    let thing = Thing::new(STAGE_ID, stage_type());
    server.register(Arc::clone(&thing)).unwrap();

    let (server_end, client_end) = memory::pair();
    server.serve_connection(server_end);
    let connection = ClientConnection::new(client_end, settings);
    Harness {
        server,
        thing,
        connection,
    }
}

/// Started harness with the stage already enabled.
pub async fn start_enabled() -> Harness {
    let harness = start();
    harness
        .proxy()
        .invoke_action("enable", Value::Null)
        .await
        .unwrap();
    harness
}
