//! `busrpc` core: connection settings, service descriptors, and the call/reply
//! envelopes exchanged over the bus.

pub mod descriptor;
pub mod envelope;
pub mod settings;
pub mod subject;

pub use descriptor::ServiceDescriptor;
pub use envelope::{
    codes, decode_payload, CallContext, CallEnvelope, CallId, HandlerFailure, Payload, Reply,
    ReplyEnvelope,
};
pub use settings::{
    ConnectionSettings, HandlerConfigDoc, HandlerSettings, SettingsError, TriggerConfig,
};
