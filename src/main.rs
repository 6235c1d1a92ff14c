//! `remote_daq` command line.
//!
//! USAGE:
//!   remote_daq serve [--config FILE] [--bind ADDR]
//!   remote_daq read   <THING> <PROPERTY> [--addr ADDR]
//!   remote_daq write  <THING> <PROPERTY> <JSON> [--addr ADDR]
//!   remote_daq invoke <THING> <ACTION> [JSON] [--addr ADDR] [--oneway]
//!   remote_daq describe <THING> [--addr ADDR]
//!   remote_daq config [--config FILE]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use remote_daq::client::ClientConnection;
use remote_daq::config::RemoteConfig;
use remote_daq::server::Server;
use remote_daq::simulated::{energy_meter_type, spawn_energy_meter};

#[derive(Parser, Debug)]
#[command(name = "remote_daq")]
#[command(version)]
#[command(about = "Host and drive remote instrument objects")]
struct Args {
    /// Configuration file (TOML); environment variables prefixed REMOTE_DAQ_ override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the simulated energy meters over TCP
    Serve {
        /// Address to listen on, overriding the configuration
        #[arg(long)]
        bind: Option<String>,
    },
    /// Read one property
    Read {
        thing: String,
        property: String,
        #[arg(long)]
        addr: Option<String>,
    },
    /// Write one property (value given as JSON)
    Write {
        thing: String,
        property: String,
        value: String,
        #[arg(long)]
        addr: Option<String>,
    },
    /// Invoke an action (arguments given as JSON object or array)
    Invoke {
        thing: String,
        action: String,
        arguments: Option<String>,
        #[arg(long)]
        addr: Option<String>,
        /// Do not wait for a reply
        #[arg(long)]
        oneway: bool,
    },
    /// Print a thing's description
    Describe {
        thing: String,
        #[arg(long)]
        addr: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<RemoteConfig> {
    let config = match path {
        Some(path) => RemoteConfig::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => RemoteConfig::load().context("failed to load configuration")?,
    };
    Ok(config)
}

// bare words are taken as strings so `write meter serial_number CR524` works
fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

async fn connect(config: &RemoteConfig, addr: Option<String>) -> Result<ClientConnection> {
    let addr = addr.unwrap_or_else(|| config.server.bind_address.clone());
    ClientConnection::connect_tcp(addr.as_str(), config.client.clone())
        .await
        .with_context(|| format!("failed to connect to {}", addr))
}

async fn serve(mut config: RemoteConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }

    let server = Server::new(config.server.clone());
    let meter_type = energy_meter_type()?;
    let interval = Duration::from_millis(config.simulation.sample_interval_ms);
    for id in &config.simulation.energy_meters {
        server.register(spawn_energy_meter(id.clone(), meter_type.clone(), interval)?)?;
    }

    let listener = server.bind().await?;
    info!("hosting {:?}", server.thing_ids());
    server
        .listen_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    remote_daq::logging::init(&config.logging)?;

    match args.command {
        Command::Serve { bind } => serve(config, bind).await?,
        Command::Read { thing, property, addr } => {
            let connection = connect(&config, addr).await?;
            print(&connection.proxy(thing).read_property(&property).await?)?;
        }
        Command::Write {
            thing,
            property,
            value,
            addr,
        } => {
            let connection = connect(&config, addr).await?;
            connection
                .proxy(thing)
                .write_property(&property, parse_json(&value))
                .await?;
        }
        Command::Invoke {
            thing,
            action,
            arguments,
            addr,
            oneway,
        } => {
            let connection = connect(&config, addr).await?;
            let arguments = match arguments {
                Some(text) => parse_json(&text),
                None => Value::Null,
            };
            let proxy = connection.proxy(thing);
            if oneway {
                proxy.invoke_action_oneway(&action, arguments).await?;
                // the process exits right after, so wait for the frame to leave
                connection.flush().await?;
            } else {
                print(&proxy.invoke_action(&action, arguments).await?)?;
            }
        }
        Command::Describe { thing, addr } => {
            let connection = connect(&config, addr).await?;
            let description = connection.proxy(thing).load_description().await?;
            print(&serde_json::to_value(description.as_ref())?)?;
        }
        Command::Config => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}
