//! Wire protocol between the filter and the worker.
//!
//! Requests flow over the worker's stdin as length-prefixed binary frames
//! ([`outbound`]); replies come back over its stdout as line-oriented records
//! ([`inbound`]).

pub mod inbound;
pub mod outbound;

pub use inbound::{
    AttributeRecord, AttributeSink, ERROR_SENTINEL, FramingError, ProtocolSession, Record,
    SessionOutcome, SessionState, WireReader,
};
pub use outbound::{ImagePayload, PayloadError, synthesize_rgb, write_frame, write_request};
