/*!
 * Monitoring
 * Structured tracing for the socket layer
 */

mod tracer;

pub use tracer::{init_tracing, span_call, CallSpan, ENV_TRACE_JSON};
