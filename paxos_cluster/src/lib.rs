//! This crate is the peer layer of a Paxos node. It reads the cluster roster,
//! keeps one connection open to every member, and fans prepare and accept
//! requests out to the cluster, collecting whatever replies arrive within a
//! short window. Deciding whether a quorum was reached, and everything else
//! about proposers and acceptors, is left to the caller.
//!
//! Communication goes through the [`transport::Transport`] trait so that the
//! consensus logic can be exercised over in-memory channels; a TCP transport
//! is provided in [`tcp`].
pub mod broadcast;
pub mod cluster;
pub mod config;
pub mod error;
pub mod message;
pub mod roster;
pub mod tcp;
pub mod transport;

pub use broadcast::PeerReply;
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::{CallError, ClusterError, RosterError};
