use crossbeam_channel::{unbounded, Sender};
use paxos_cluster::{
    message::{
        PrepareRequest, PrepareResponse, ProposalId, ProposalRequest, ProposalResponse, Request,
        Response, RoleId, SuccessNotify,
    },
    roster::Roster,
    tcp::{TcpChannel, TcpTransport},
    transport::{Channel, RequestHandler},
    CallError, Cluster, ClusterConfig, ClusterError,
};
use std::{
    collections::BTreeMap,
    net::TcpListener,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

const CALL_TIMEOUT: Duration = Duration::from_secs(3);

// Acceptor is a minimal single-decree-per-slot acceptor, enough to answer the
// requests the peer layer sends.
struct Acceptor {
    role_id: RoleId,
    state: Mutex<AcceptorState>,
    heartbeats: Sender<(RoleId, RoleId)>,
}

#[derive(Default)]
struct AcceptorState {
    min_proposal: ProposalId,
    accepted: BTreeMap<u64, (ProposalId, Vec<u8>)>,
    chosen: BTreeMap<u64, Vec<u8>>,
}

impl AcceptorState {
    fn first_unchosen_index(&self) -> u64 {
        (1..).find(|index| !self.chosen.contains_key(index)).unwrap_or(0)
    }
}

impl RequestHandler for Acceptor {
    fn handle(&self, request: Request) -> Result<Response, String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        match request {
            Request::Prepare(prepare) => {
                let promised = prepare.proposal_id >= state.min_proposal;
                if promised {
                    state.min_proposal = prepare.proposal_id;
                }
                let accepted = state.accepted.get(&prepare.index).cloned();
                Ok(Response::Prepare(PrepareResponse {
                    promised,
                    accepted_proposal: accepted.as_ref().map(|(id, _)| *id),
                    accepted_value: accepted.map(|(_, value)| value),
                    no_more_accepted: state.accepted.range(prepare.index..).next().is_none(),
                }))
            }
            Request::Accept(proposal) => {
                if proposal.proposal_id >= state.min_proposal {
                    state.min_proposal = proposal.proposal_id;
                    state
                        .accepted
                        .insert(proposal.index, (proposal.proposal_id, proposal.value));
                }
                Ok(Response::Accept(ProposalResponse {
                    min_proposal: state.min_proposal,
                    first_unchosen_index: state.first_unchosen_index(),
                }))
            }
            Request::Success(info) => {
                if info.value.is_empty() {
                    return Err(String::from("empty value cannot be chosen"));
                }
                state.chosen.insert(info.index, info.value);
                Ok(Response::Success(state.first_unchosen_index()))
            }
            Request::Heartbeat(from) => {
                let _ = self.heartbeats.send((self.role_id, from));
                Ok(Response::Heartbeat(true))
            }
        }
    }
}

fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("could not reserve port"))
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().expect("bound address").port())
        .collect()
}

fn roster(ports: &[u16]) -> Roster {
    let text: String = ports
        .iter()
        .enumerate()
        .map(|(i, port)| format!("{},127.0.0.1,{}\n", i + 1, port))
        .collect();
    Roster::parse(&text).expect("valid roster")
}

fn node(roster: &Roster, role_id: RoleId) -> Cluster {
    let (cluster, _) = Cluster::from_roster(
        ClusterConfig::default().with_reply_timeout(Duration::from_secs(2)),
        Arc::new(TcpTransport::default()),
        roster.clone(),
        role_id,
    )
    .expect("could not build cluster");
    cluster
}

// Starts a listening node for every roster entry and returns them in role
// order together with the channel acceptors report heartbeats on.
fn start_nodes(roster: &Roster) -> (Vec<Cluster>, crossbeam_channel::Receiver<(RoleId, RoleId)>) {
    let (heartbeats_tx, heartbeats_rx) = unbounded();
    let nodes = roster
        .entries()
        .map(|entry| {
            let cluster = node(roster, entry.role_id);
            let bound = cluster
                .listen(Arc::new(Acceptor {
                    role_id: entry.role_id,
                    state: Mutex::new(AcceptorState::default()),
                    heartbeats: heartbeats_tx.clone(),
                }))
                .expect("could not listen");
            assert_eq!(bound.port(), entry.port);
            cluster
        })
        .collect();
    (nodes, heartbeats_rx)
}

#[test]
fn paxos_round_over_tcp() -> Result<(), ClusterError> {
    let roster = roster(&free_ports(3));
    let (nodes, heartbeats) = start_nodes(&roster);
    let proposer = &nodes[0];
    proposer.connect()?;

    let proposal_id = ProposalId::new(1, proposer.self_id());
    let (count, promises) = proposer.broadcast_prepare(PrepareRequest {
        proposal_id,
        index: 1,
    });
    assert_eq!(count, 3);
    let promises: Vec<_> = promises.iter().collect();
    assert_eq!(promises.len(), 3);
    for reply in &promises {
        let promise = reply.outcome.clone().expect("promise");
        assert!(promise.promised);
        assert_eq!(promise.accepted_proposal, None);
        assert!(promise.no_more_accepted);
        proposer.set_promise_requirement(reply.role_id, false)?;
    }

    let (count, accepts) = proposer.broadcast_accept(ProposalRequest {
        proposal_id,
        index: 1,
        value: b"x=1".to_vec(),
        first_unchosen_index: 1,
    });
    assert_eq!(count, 3);
    let accepts: Vec<_> = accepts.iter().collect();
    assert_eq!(accepts.len(), 3);
    for reply in accepts {
        assert_eq!(reply.outcome.expect("accept").min_proposal, proposal_id);
    }

    // Everybody promised, so the next prepare is elided.
    let (count, promises) = proposer.broadcast_prepare(PrepareRequest {
        proposal_id,
        index: 2,
    });
    assert_eq!(count, 0);
    assert_eq!(promises.iter().count(), 0);

    let replies: Vec<_> = proposer
        .notify_success(
            2,
            SuccessNotify {
                index: 1,
                value: b"x=1".to_vec(),
            },
        )
        .iter()
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].outcome, Ok(2));

    proposer.broadcast_heartbeat(proposer.self_id());
    let mut pulsed: Vec<RoleId> = (0..3)
        .map(|_| {
            let (to, from) = heartbeats
                .recv_timeout(Duration::from_secs(2))
                .expect("heartbeat was not delivered");
            assert_eq!(from, 1);
            to
        })
        .collect();
    pulsed.sort_unstable();
    assert_eq!(pulsed, vec![1, 2, 3]);

    Ok(())
}

#[test]
fn rejected_request_is_reported_as_remote_error() -> Result<(), ClusterError> {
    let roster = roster(&free_ports(2));
    let (nodes, _heartbeats) = start_nodes(&roster);
    nodes[0].connect()?;

    let replies: Vec<_> = nodes[0]
        .notify_success(
            2,
            SuccessNotify {
                index: 1,
                value: Vec::new(),
            },
        )
        .iter()
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(
        replies[0].outcome,
        Err(CallError::Remote(String::from("empty value cannot be chosen")))
    );

    Ok(())
}

#[test]
fn connect_fails_when_a_peer_is_down() {
    let ports = free_ports(3);
    let roster = roster(&ports);
    // Only the first two roles listen.
    let (heartbeats_tx, _heartbeats_rx) = unbounded();
    let nodes: Vec<Cluster> = (1..=2)
        .map(|role_id| {
            let cluster = node(&roster, role_id);
            cluster
                .listen(Arc::new(Acceptor {
                    role_id,
                    state: Mutex::new(AcceptorState::default()),
                    heartbeats: heartbeats_tx.clone(),
                }))
                .expect("could not listen");
            cluster
        })
        .collect();

    match nodes[0].connect() {
        Err(ClusterError::Dial { role_id, .. }) => assert_eq!(role_id, 3),
        other => panic!("unexpected result {:?}", other.map_err(|e| e.to_string())),
    }
    assert!(!nodes[0].is_connected());
}

#[test]
fn listening_twice_on_one_address_fails() {
    let roster = roster(&free_ports(1));
    let (nodes, _heartbeats) = start_nodes(&roster);
    let (heartbeats_tx, _heartbeats_rx) = unbounded();

    let result = nodes[0].listen(Arc::new(Acceptor {
        role_id: 1,
        state: Mutex::new(AcceptorState::default()),
        heartbeats: heartbeats_tx,
    }));
    assert!(matches!(result, Err(ClusterError::Listen { .. })));
}

#[test]
fn concurrent_calls_get_their_own_replies() {
    let roster = roster(&free_ports(1));
    let (_nodes, _heartbeats) = start_nodes(&roster);
    let entry = roster.get(1).expect("entry").clone();
    let channel = Arc::new(
        TcpChannel::connect(&entry.address, entry.port, CALL_TIMEOUT).expect("dial"),
    );

    let workers: Vec<_> = (0..8u64)
        .map(|i| {
            let channel = channel.clone();
            thread::spawn(move || channel.call(Request::Heartbeat(100 + i)))
        })
        .collect();
    for worker in workers {
        let reply = worker.join().expect("worker panicked");
        assert_eq!(reply, Ok(Response::Heartbeat(true)));
    }

    let workers: Vec<_> = (1..=8u64)
        .map(|index| {
            let channel = channel.clone();
            thread::spawn(move || {
                channel.call(Request::Accept(ProposalRequest {
                    proposal_id: ProposalId::new(1, 1),
                    index,
                    value: index.to_be_bytes().to_vec(),
                    first_unchosen_index: 1,
                }))
            })
        })
        .collect();
    for worker in workers {
        match worker.join().expect("worker panicked") {
            Ok(Response::Accept(accepted)) => {
                assert_eq!(accepted.min_proposal, ProposalId::new(1, 1))
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}

#[test]
fn call_fails_when_peer_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("bound address").port();
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            drop(stream);
        }
    });

    let channel = TcpChannel::connect("127.0.0.1", port, CALL_TIMEOUT).expect("dial");
    let result = channel.call(Request::Heartbeat(1));
    assert!(matches!(
        result,
        Err(CallError::Disconnected) | Err(CallError::Io(_))
    ));
}

#[test]
fn calls_to_a_mute_peer_time_out() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("bound address").port();
    let (held_tx, held_rx) = unbounded();
    thread::spawn(move || {
        // Keeps the connection open without ever answering.
        if let Ok((stream, _)) = listener.accept() {
            let _ = held_tx.send(stream);
        }
    });

    let call_timeout = Duration::from_millis(300);
    let channel =
        Arc::new(TcpChannel::connect("127.0.0.1", port, call_timeout).expect("dial"));
    let start = Instant::now();
    let workers: Vec<_> = (0..50u64)
        .map(|i| {
            let channel = channel.clone();
            thread::spawn(move || channel.call(Request::Heartbeat(i)))
        })
        .collect();
    for worker in workers {
        let result = worker.join().expect("worker panicked");
        assert_eq!(result, Err(CallError::Timeout(call_timeout)));
    }
    assert!(start.elapsed() < Duration::from_secs(2));
    drop(held_rx);
}
