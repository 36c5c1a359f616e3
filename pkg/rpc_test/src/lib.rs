//! Integration tests exercising the full `rpc` dispatcher/driver pair
//! against `rpc_util::loopback`, rather than one module's internals in
//! isolation.

#[macro_use]
extern crate common;
#[macro_use]
extern crate macros;
