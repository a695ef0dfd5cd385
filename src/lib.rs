pub mod args;
pub mod config;
pub mod error;
pub mod path;
pub mod proxy;
pub mod reconnect;
pub mod runtime;
pub mod session_code;
pub mod subsystem;
pub mod tunnel;
pub mod utils;
