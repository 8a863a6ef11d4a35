//! Evidence path from raw captured text to queued envelopes.
//!
//! ```text
//! RawCandidate -> parser::parse -> Deduplicator -> Envelope -> Router -> queue dir
//!                                                                   \-> TaskBridge
//! ```

pub mod dedup;
pub mod envelope;
pub mod parser;
pub mod queue;
pub mod router;

pub use dedup::{signature, Deduplicator, SignatureCache};
pub use envelope::{Envelope, EnvelopeType, ENVELOPE_VERSION};
pub use parser::{parse, Payload, PayloadKind, TaskSignal, EMPTY_MARKER};
pub use queue::QueueDir;
pub use router::{Delivery, RetryPolicy, RetryReport, Router};
