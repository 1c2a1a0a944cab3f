#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod error;
pub mod region;
pub mod storage;

pub use error::{Error, Result};
pub use region::Region;
pub use storage::bitcask::{Bitcask, Config};
