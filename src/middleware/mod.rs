// Middleware for resilient upstream calls
//
// Provides quota-aware API key rotation

pub mod api_key_pool;

// Re-export commonly used types
pub use api_key_pool::{ApiKeyPool, KeyHealth, KeyStats, MAX_COOLDOWN};
