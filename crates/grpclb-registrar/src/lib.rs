//! grpclb registrar
//!
//! Announces one service instance under `/grpclb/<service>/<address>` with its
//! weight as the value, bound to a lease that a background task keeps alive.
//! Closing revokes the lease so the key disappears immediately; otherwise the
//! store removes it once the TTL lapses.

mod config;
mod registrar;

pub use config::RegistrarConfig;
pub use registrar::Registrar;
