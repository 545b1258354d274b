//! L3: arbitrary-length messages over the frame-at-a-time protocol layer,
//! plus L3.1: sharing one (transport, router) pair across sessions bound
//! to the same local endpoint.

mod manager;
mod session;

pub use manager::SessionManager;
pub use session::Session;
