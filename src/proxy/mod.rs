//! Host-header VM request routing.
//!
//! Every inbound request is offered to the router first. Hosts shaped like
//! `<vm>-<port>.<domain>` are dispatched to the named VM — reverse-proxied
//! when it runs, woken when it sleeps — and every other host falls through
//! to the management API untouched.

mod forward;
mod router;
mod wakeup;

pub(crate) use forward::Forwarder;
pub use router::{vm_request_middleware, VmRouter, AGENT_PORT, TOKEN_HEADER};
