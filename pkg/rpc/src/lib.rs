#[macro_use]
extern crate common;
#[macro_use]
extern crate macros;

pub mod client;
pub mod context;
pub mod deadline;
pub mod metadata;
pub mod method;
pub mod middleware;
pub mod server;
pub mod signal;
pub mod status;
pub mod stream;
pub mod terminator;
pub mod transport;
