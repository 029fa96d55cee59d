//! Query capability and its HTTP implementation.

mod capability;
mod llm_client;
mod rate_limiter;

pub use capability::*;
pub use llm_client::*;
pub use rate_limiter::*;
