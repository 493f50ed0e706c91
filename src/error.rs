//! Facade-level error type. Each lower layer (bencode, krpc) has its
//! own error enum; this one covers what can go wrong constructing or
//! running a `Dht`, per `spec.md` §7 "Fatal".

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] io::Error),
    #[error("routing table invariant violated: {0}")]
    InvariantViolation(String),
}
