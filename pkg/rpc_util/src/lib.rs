#[macro_use]
extern crate common;
#[macro_use]
extern crate macros;

pub mod logging;
pub mod loopback;
