pub mod breakpoint;
pub mod config;
pub mod dap;
pub mod error;
pub mod gate;
pub mod log;
pub mod register;
pub mod rpc;
pub mod session;
pub mod terminal;
