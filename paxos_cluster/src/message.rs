use serde::{Deserialize, Serialize};

pub type RoleId = u64;

// ProposalId orders proposals first by round and then by the proposing role,
// which makes every proposal number unique across the cluster.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProposalId {
    pub round: u64,
    pub role_id: RoleId,
}

impl ProposalId {
    pub fn new(round: u64, role_id: RoleId) -> ProposalId {
        ProposalId { round, role_id }
    }
}

// PrepareRequest is sent by proposers in the first phase to reserve a
// proposal number for a log slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub proposal_id: ProposalId,
    pub index: u64,
}

// PrepareResponse carries the acceptor's promise. If the acceptor had already
// accepted a value for the slot, that proposal and value are returned so the
// proposer can adopt it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub promised: bool,
    pub accepted_proposal: Option<ProposalId>,
    pub accepted_value: Option<Vec<u8>>,
    // True when the acceptor has no accepted values beyond the slot.
    pub no_more_accepted: bool,
}

// ProposalRequest asks acceptors to accept a value for a slot in the second
// phase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRequest {
    pub proposal_id: ProposalId,
    pub index: u64,
    pub value: Vec<u8>,
    pub first_unchosen_index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalResponse {
    // Highest proposal the acceptor has promised. The proposal was accepted
    // iff this equals the proposal that was sent.
    pub min_proposal: ProposalId,
    pub first_unchosen_index: u64,
}

// SuccessNotify tells a single acceptor that the value of a slot is chosen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessNotify {
    pub index: u64,
    pub value: Vec<u8>,
}

/// Request is every message this layer sends to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Prepare(PrepareRequest),
    Accept(ProposalRequest),
    Success(SuccessNotify),
    Heartbeat(RoleId),
}

/// Response pairs with Request variant by variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Prepare(PrepareResponse),
    Accept(ProposalResponse),
    // First unchosen index of the notified acceptor.
    Success(u64),
    Heartbeat(bool),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Prepare(_) => "prepare",
            Request::Accept(_) => "accept",
            Request::Success(_) => "success",
            Request::Heartbeat(_) => "heartbeat",
        }
    }
}
