//! Drives ACME (RFC 8555) orders from creation to a downloaded certificate,
//! proving control of each identifier with HTTP-01 challenges.
//!
//! The [`OrderOrchestrator`] talks to the CA through an [`AcmeTransport`]
//! (usually [`HttpTransport`]) and makes challenge responses fetchable
//! through a [`ResponsePublisher`].

mod account;
mod authorization;
mod challenge;
mod config;
mod directory;
mod error;
mod helpers;
mod jws;
mod orchestrator;
mod order;
mod poll;
mod publisher;
mod transport;

pub use account::*;
pub use authorization::*;
pub use challenge::*;
pub use config::*;
pub use directory::*;
pub use error::*;
pub use helpers::gen_ec_p256_private_key;
pub use helpers::gen_rsa_private_key;
pub use helpers::DomainNames;
pub use helpers::Identifier;
pub use jws::Jwk;
pub use jws::Thumbprint;
pub use orchestrator::*;
pub use order::*;
pub use poll::*;
pub use publisher::*;
pub use transport::*;
