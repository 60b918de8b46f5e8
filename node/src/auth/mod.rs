//! Admin API authentication.

mod middleware;

pub use middleware::AdminAuth;
