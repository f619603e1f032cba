//! Debug Adapter Protocol plumbing: envelopes, framing and traffic tracing.

pub mod io;
pub mod protocol;
pub mod tracer;

pub use io::{DapConnection, DapOutput, DapReader};
pub use protocol::{ClientResponse, DapRequest, Incoming};
pub use tracer::FileTracer;
