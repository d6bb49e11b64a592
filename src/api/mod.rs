// =============================================================================
// Control surface (§6): REST endpoints, bearer auth, and the WS push stream.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod stream;
