use crate::{
    cluster::Cluster,
    error::CallError,
    message::{
        PrepareRequest, PrepareResponse, ProposalRequest, ProposalResponse, Request, Response,
        RoleId, SuccessNotify,
    },
    transport::{lock, Channel},
};
use crossbeam_channel::{after, bounded, select, Receiver, Sender};
use std::{sync::Arc, thread, time::Duration};
use tracing::{debug, trace};

/// PeerReply is the outcome of one request to one peer: either the decoded
/// response or the error hit while talking to that peer.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerReply<R> {
    pub role_id: RoleId,
    pub outcome: Result<R, CallError>,
}

type Target = (RoleId, Option<Arc<dyn Channel>>);

impl Cluster {
    /// Sends a prepare request to every peer that still has to promise. When
    /// a majority of the cluster is already exempt the phase is skipped and
    /// nothing is sent. Returns the number of peers asked and a stream that
    /// yields at most that many replies.
    pub fn broadcast_prepare(
        &self,
        request: PrepareRequest,
    ) -> (usize, Receiver<PeerReply<PrepareResponse>>) {
        let targets: Vec<Target> = {
            let membership = lock(&self.membership);
            let majority = membership.majority();
            if membership.exempt_count < majority {
                membership
                    .peers
                    .values()
                    .filter(|peer| peer.requires_promise)
                    .map(|peer| peer.target())
                    .collect()
            } else {
                debug!(
                    exempt = membership.exempt_count,
                    majority, "skipping prepare phase"
                );
                Vec::new()
            }
        };

        self.fan_out(targets, Request::Prepare(request), |response| match response {
            Response::Prepare(promise) => Some(promise),
            _ => None,
        })
    }

    /// Sends a proposal to every peer. Exemptions only apply to prepare.
    pub fn broadcast_accept(
        &self,
        request: ProposalRequest,
    ) -> (usize, Receiver<PeerReply<ProposalResponse>>) {
        let targets: Vec<Target> = lock(&self.membership)
            .peers
            .values()
            .map(|peer| peer.target())
            .collect();

        self.fan_out(targets, Request::Accept(request), |response| match response {
            Response::Accept(accepted) => Some(accepted),
            _ => None,
        })
    }

    /// Tells one peer that a value was chosen. The stream yields a single
    /// reply carrying the peer's first unchosen index, an error, or nothing
    /// if the peer stays silent past the reply window.
    pub fn notify_success(&self, role_id: RoleId, info: SuccessNotify) -> Receiver<PeerReply<u64>> {
        let target = lock(&self.membership)
            .peers
            .get(&role_id)
            .map(|peer| peer.target());

        match target {
            Some(target) => {
                let (_, replies) =
                    self.fan_out(vec![target], Request::Success(info), |response| {
                        match response {
                            Response::Success(first_unchosen_index) => Some(first_unchosen_index),
                            _ => None,
                        }
                    });
                replies
            }
            None => {
                let (tx, rx) = bounded(1);
                let _ = tx.send(PeerReply {
                    role_id,
                    outcome: Err(CallError::UnknownPeer(role_id)),
                });
                rx
            }
        }
    }

    /// Sends a liveness pulse from `role_id` to every connected peer. Nothing
    /// is collected and failures never reach the caller.
    pub fn broadcast_heartbeat(&self, role_id: RoleId) {
        let channels: Vec<(RoleId, Arc<dyn Channel>)> = lock(&self.membership)
            .peers
            .values()
            .filter_map(|peer| peer.channel.clone().map(|channel| (peer.role_id, channel)))
            .collect();

        for (peer_id, channel) in channels {
            thread::spawn(move || {
                if let Err(err) = channel.call(Request::Heartbeat(role_id)) {
                    trace!(peer_id, %err, "heartbeat not delivered");
                }
            });
        }
    }

    // Issues the request to every target on its own thread and hands the
    // replies to an aggregator that stops after all targets answered or the
    // reply window elapsed.
    fn fan_out<R>(
        &self,
        targets: Vec<Target>,
        request: Request,
        extract: fn(Response) -> Option<R>,
    ) -> (usize, Receiver<PeerReply<R>>)
    where
        R: Send + 'static,
    {
        let peer_count = targets.len();
        let (endpoint_tx, endpoint_rx) = bounded(peer_count);
        for (role_id, channel) in targets {
            let request = request.clone();
            let endpoint = endpoint_tx.clone();
            thread::spawn(move || {
                let outcome = call_peer(channel.as_deref(), request, extract);
                if endpoint.send(PeerReply { role_id, outcome }).is_err() {
                    debug!(role_id, "dropped reply that arrived after the reply window");
                }
            });
        }

        let (forward_tx, forward_rx) = bounded(peer_count);
        let window = self.config.reply_timeout;
        thread::spawn(move || collect_replies(peer_count, window, endpoint_rx, forward_tx));
        (peer_count, forward_rx)
    }
}

fn call_peer<R>(
    channel: Option<&dyn Channel>,
    request: Request,
    extract: fn(Response) -> Option<R>,
) -> Result<R, CallError> {
    let channel = channel.ok_or(CallError::NotConnected)?;
    let expected = request.kind();
    let response = channel.call(request)?;
    extract(response).ok_or(CallError::UnexpectedResponse { expected })
}

// Forwards replies in arrival order. The window is measured from the start of
// aggregation; once it closes, anything still in flight is never delivered.
// Dropping `forward` on return closes the caller's stream.
fn collect_replies<R>(
    peer_count: usize,
    window: Duration,
    endpoint: Receiver<PeerReply<R>>,
    forward: Sender<PeerReply<R>>,
) {
    let deadline = after(window);
    let mut received = 0;
    while received < peer_count {
        select! {
            recv(endpoint) -> reply => match reply {
                Ok(reply) => {
                    if forward.send(reply).is_err() {
                        return;
                    }
                    received += 1;
                }
                Err(_) => return,
            },
            recv(deadline) -> _ => {
                debug!(received, peer_count, "reply window closed");
                return;
            }
        }
    }
}
