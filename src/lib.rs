pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod extension;
pub mod membership;
pub mod remoting;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
