use crate::message::RoleId;
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("could not read roster {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("line {line}: expected roleId,address,port but found {found} fields")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: invalid role id {value:?}")]
    RoleId { line: usize, value: String },
    #[error("line {line}: role id 0 is reserved")]
    ReservedRoleId { line: usize },
    #[error("line {line}: invalid port {value:?}")]
    Port { line: usize, value: String },
    #[error("line {line}: role id {role_id} appears more than once")]
    DuplicateRoleId { line: usize, role_id: RoleId },
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error("could not resolve local host address: {0}")]
    Hostname(#[source] io::Error),
    #[error("could not find any of {addresses:?} in the roster")]
    SelfNotFound { addresses: Vec<String> },
    #[error("role id {0} is not in the roster")]
    UnknownPeer(RoleId),
    #[error("already connected to peers")]
    AlreadyConnected,
    #[error("could not connect to peer {role_id} at {address}: {source}")]
    Dial {
        role_id: RoleId,
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("could not listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// CallError is the failure of a single request to a single peer. It is
/// delivered to the caller next to the successful replies of other peers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("no open channel to peer")]
    NotConnected,
    #[error("role id {0} is not in the roster")]
    UnknownPeer(RoleId),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("could not encode or decode message: {0}")]
    Codec(String),
    #[error("connection to peer closed")]
    Disconnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("peer rejected request: {0}")]
    Remote(String),
    #[error("peer answered a {expected} request with a different response")]
    UnexpectedResponse { expected: &'static str },
}

impl From<io::Error> for CallError {
    fn from(err: io::Error) -> Self {
        CallError::Io(err.to_string())
    }
}

impl From<bincode::Error> for CallError {
    fn from(err: bincode::Error) -> Self {
        CallError::Codec(err.to_string())
    }
}
