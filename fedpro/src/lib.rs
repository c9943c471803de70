//! fedpro: client session engine for the HLA Federate Protocol.
//!
//! Carries opaque service payloads between a federate and a remote RTI over a
//! single framed connection: sequence-numbered calls matched to their
//! replies, callbacks delivered in order either immediately or on demand, and
//! one place where transport loss or a protocol violation is detected and
//! fanned out to every waiter.

pub mod callback;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod session;
pub mod state;
pub mod transport;
pub mod wire;

pub use callback::{CallbackEnvelope, CallbackHandler, DeliveryMode, EvokeBudget};
pub use config::{ConfigError, HeartbeatConfig, ReconnectPolicy, SessionConfig};
pub use error::{CallbackError, ServiceError, SessionError};
pub use session::{Session, SessionId};
pub use state::SessionState;
pub use transport::{Connection, DEFAULT_PORT, Endpoint, EndpointError};
pub use wire::{Frame, FrameType, MalformedFrame, OrderingClass};
