//! Rate-limiting and cooldown primitives.
//!
//! Both primitives are keyed by an opaque identifier, keep every entry behind
//! an expiry timestamp, and mutate through atomic check-and-update under a
//! single per-structure lock, so near-simultaneous attempts for one key
//! resolve deterministically. Expired entries are pruned lazily on lookup and
//! by the explicit `prune` sweeps.

pub mod cooldown;
pub mod rate_limiter;

pub use cooldown::CooldownCache;
pub use rate_limiter::RateLimiter;
