pub mod addr;
pub mod error;
pub mod fwmark;
pub mod ipc;
pub mod ndp;
pub mod net_util;

pub use error::{Error, ErrorKind, Result};
