//! An async client engine for the rosbridge v2 WebSocket protocol.
//!
//! [`RosBridge`] is the entry point: it owns one connection to a rosbridge
//! server and hands out [`Topic`], [`ServiceClient`], [`Parameter`],
//! [`RosApi`], [`ActionClient`] and [`SimpleActionServer`] handles that all
//! share it.
//!
//! ```no_run
//! use rosbridge_client::{RosBridge, RosBridgeConfig};
//!
//! # async fn example() -> rosbridge_common::Result<()> {
//! let bridge = RosBridge::connect(RosBridgeConfig::new("localhost", 9090));
//! bridge.run().await?;
//!
//! let mut chatter = bridge.topic("/chatter", "std_msgs/String").subscribe().await?;
//! let msg = chatter.next().await?;
//! println!("{msg}");
//! # Ok(())
//! # }
//! ```

pub mod actionlib;
pub mod connection;
pub mod events;
pub mod id;
pub mod parameter;
pub mod protocol;
pub mod rosapi;
pub mod service;
pub mod session;
pub mod topic;
pub mod transport;

pub use actionlib::client::{ActionClient, Goal};
pub use actionlib::server::{ActiveGoalHandle, SimpleActionServer};
pub use actionlib::GoalState;
pub use connection::{Backoff, ConnState, ConnectionManager};
pub use events::{EventBus, Listener, ListenerId};
pub use id::IdAllocator;
pub use parameter::Parameter;
pub use protocol::{Compression, Multiplexer};
pub use rosapi::RosApi;
pub use service::{advertise_service, service_fn, ServiceClient, ServiceServerHandle};
pub use session::{RosBridge, RosBridgeConfig};
pub use topic::{Publisher, Subscription, Topic};
pub use transport::{Connector, Transport, TransportEvent, WsConnector, WsTransport};

pub use rosbridge_common::{shapes, Error, Result, Value};
