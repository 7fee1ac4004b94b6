pub mod addr;
pub mod error;
pub mod health;
pub mod listener;
pub mod optimizer;
pub mod pool;
pub mod proxy;
pub mod session;
pub mod socks;
pub mod supervisor;

#[cfg(test)]
pub mod test_support;

pub use addr::Host;
pub use error::ProxyError;
pub use proxy::{ProxyDescriptor, Scheme};
