//! Client side: connections, proxies and the noblock reply cache.
//!
//! ```rust,ignore
//! let connection = ClientConnection::connect_tcp("127.0.0.1:7400", ClientSettings::default()).await?;
//! let meter = connection.proxy("energy-meter");
//! meter.load_description().await?;
//! let wavelength: f64 = meter.get("wavelength").await?;
//! ```

mod blocking;
mod connection;
mod proxy;
mod reply_cache;

pub use blocking::BlockingProxy;
pub use connection::ClientConnection;
pub use proxy::{CallOptions, EventSubscription, Invocation, InvocationMode, ObjectProxy};
pub use reply_cache::{Missing, PendingReply, ReplyCache};
