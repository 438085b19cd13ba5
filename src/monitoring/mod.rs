/*!
 * Monitoring
 * Tracing initialization and RPC spans
 */

mod tracer;

pub use tracer::{init_tracing, RpcSpan};
