#![doc = include_str!("../README.md")]

pub mod address;
pub mod builder;
mod error;
pub mod kernel;
mod netlink;
pub mod nscache;
pub mod ovs;
pub mod pipeline;
pub mod routeplan;
pub mod worker;

pub use error::{Error, Result};
