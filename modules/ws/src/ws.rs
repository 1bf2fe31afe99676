//! WebSocket subscription fabric: the subscription wire protocol, the
//! connection/subscription registry, the event dispatcher that fans
//! partitioned-log records out to subscribers, and the publisher feeding
//! that log.

pub mod dispatcher;
pub mod handler;
pub mod protocol;
pub mod publisher;
pub mod push;
pub mod query;
pub mod stores;

pub use dispatcher::Dispatcher;
pub use handler::{Handler, SocketEvent, SocketResponse, TopicResolver};
pub use publisher::{EventLog, Publisher};
pub use push::{ClientCache, PushApi, PushApiFactory, PushError};
