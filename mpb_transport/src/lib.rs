//! Multipath session controller over connection-oriented datagram
//! transports.

pub mod config;
pub mod link;
pub mod logging;
pub mod multipath;
pub mod sim;
pub mod transport;

pub use config::{ConfigError, SchedulerAlgorithm, SessionConfig};
pub use link::{LinkId, LinkInfo, LinkRegistry, StaticLinkRegistry};
pub use multipath::{MultipathContext, Session, SessionState, Subflow, SubflowState};
pub use transport::{ConnState, ConnectionEvents, DatagramConnection, HookKind, TransportProvider};
