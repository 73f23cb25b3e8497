//! Capability/provider catalog and the wiring resolver
//!
//! The provider registry maps capability kinds to configurable provider
//! templates; the wiring store binds a consumer's capability requirement to
//! one concrete provider instance and produces the environment injected into
//! the consumer's deployment.

pub mod template;
pub mod wiring;

pub use template::{EnvMapping, Provider, ProviderError, ProviderInstance, ProviderRegistry};
pub use wiring::{ResolvedEnv, Wiring, WiringError, WiringStore};
