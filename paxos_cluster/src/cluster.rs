use crate::{
    config::ClusterConfig,
    error::ClusterError,
    message::RoleId,
    roster::{Roster, RosterEntry},
    transport::{lock, Channel, RequestHandler, Transport},
};
use std::{
    collections::BTreeMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex},
};
use tracing::{debug, info};

// Peer is the local view of one cluster member. Only the address is fixed;
// the channel is installed by connect and the promise flag moves with the
// consensus rounds.
pub(crate) struct Peer {
    pub(crate) role_id: RoleId,
    pub(crate) address: String,
    pub(crate) port: u16,
    pub(crate) channel: Option<Arc<dyn Channel>>,
    pub(crate) requires_promise: bool,
}

impl Peer {
    fn new(entry: &RosterEntry) -> Peer {
        Peer {
            role_id: entry.role_id,
            address: entry.address.clone(),
            port: entry.port,
            channel: None,
            requires_promise: true,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub(crate) fn target(&self) -> (RoleId, Option<Arc<dyn Channel>>) {
        (self.role_id, self.channel.clone())
    }
}

// Membership is everything that is shared between callers. exempt_count
// always equals the number of peers with requires_promise == false.
pub(crate) struct Membership {
    pub(crate) peers: BTreeMap<RoleId, Peer>,
    pub(crate) connected: bool,
    pub(crate) exempt_count: usize,
}

impl Membership {
    pub(crate) fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }
}

/// Cluster is this node's view of the whole cluster: who the members are, how
/// to reach them, and which of them still have to promise before the next
/// accept phase. Every method takes the same lock, so a Cluster can be shared
/// between threads behind an `Arc`.
pub struct Cluster {
    self_id: RoleId,
    pub(crate) config: ClusterConfig,
    transport: Arc<dyn Transport>,
    pub(crate) membership: Mutex<Membership>,
}

impl Cluster {
    /// Reads the roster named by the config and builds the cluster. An
    /// `assigned_id` of 0 means "find me in the roster by the address of this
    /// host". Returns the cluster and the id this node runs as.
    pub fn load(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        assigned_id: RoleId,
    ) -> Result<(Cluster, RoleId), ClusterError> {
        let roster = Roster::load(&config.roster_path)?;
        Cluster::from_roster(config, transport, roster, assigned_id)
    }

    pub fn from_roster(
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        roster: Roster,
        assigned_id: RoleId,
    ) -> Result<(Cluster, RoleId), ClusterError> {
        let self_id = if assigned_id == 0 {
            let addresses = local_addresses()?;
            Cluster::resolve_self_with(&roster, addresses.as_slice())?
        } else if roster.get(assigned_id).is_some() {
            assigned_id
        } else {
            return Err(ClusterError::UnknownPeer(assigned_id));
        };

        let peers: BTreeMap<RoleId, Peer> = roster
            .entries()
            .map(|entry| (entry.role_id, Peer::new(entry)))
            .collect();
        info!(self_id, peers = peers.len(), "loaded cluster roster");

        let cluster = Cluster {
            self_id,
            config,
            transport,
            membership: Mutex::new(Membership {
                peers,
                connected: false,
                exempt_count: 0,
            }),
        };
        Ok((cluster, self_id))
    }

    // Picks this node's role out of the roster given the addresses the local
    // host is known by.
    pub fn resolve_self_with<S: AsRef<str>>(
        roster: &Roster,
        local_addresses: &[S],
    ) -> Result<RoleId, ClusterError> {
        roster
            .find_by_address(local_addresses)
            .ok_or_else(|| ClusterError::SelfNotFound {
                addresses: local_addresses
                    .iter()
                    .map(|address| address.as_ref().to_string())
                    .collect(),
            })
    }

    pub fn self_id(&self) -> RoleId {
        self.self_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Opens a channel to every peer, self included, in role id order. May
    /// only succeed once. A failed dial aborts the whole operation; channels
    /// opened before the failure are left in place and the cluster stays
    /// unconnected, which callers are expected to treat as fatal.
    pub fn connect(&self) -> Result<(), ClusterError> {
        let mut membership = lock(&self.membership);
        if membership.connected {
            return Err(ClusterError::AlreadyConnected);
        }

        for peer in membership.peers.values_mut() {
            let channel = self
                .transport
                .dial(&peer.address, peer.port)
                .map_err(|source| ClusterError::Dial {
                    role_id: peer.role_id,
                    address: peer.endpoint(),
                    source,
                })?;
            debug!(role_id = peer.role_id, address = %peer.endpoint(), "connected to peer");
            peer.channel = Some(channel);
        }

        membership.connected = true;
        info!(peers = membership.peers.len(), "connected to all peers");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.membership).connected
    }

    /// Serves inbound peer requests at this node's own roster address. The
    /// accept loop runs in the background; the bound address is returned.
    pub fn listen(&self, handler: Arc<dyn RequestHandler>) -> Result<SocketAddr, ClusterError> {
        let (address, port) = {
            let membership = lock(&self.membership);
            let own = membership
                .peers
                .get(&self.self_id)
                .ok_or(ClusterError::UnknownPeer(self.self_id))?;
            (own.address.clone(), own.port)
        };

        let bound = self
            .transport
            .listen(&address, port, handler)
            .map_err(|source| ClusterError::Listen {
                address: format!("{}:{}", address, port),
                source,
            })?;
        info!(%bound, "listening for peers");
        Ok(bound)
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.membership).peers.len()
    }

    pub fn peer_ids(&self) -> Vec<RoleId> {
        lock(&self.membership).peers.keys().copied().collect()
    }

    // Number of peers that prepare broadcasts currently skip.
    pub fn exempt_count(&self) -> usize {
        lock(&self.membership).exempt_count
    }

    pub fn majority(&self) -> usize {
        lock(&self.membership).majority()
    }

    pub fn requires_promise(&self, role_id: RoleId) -> Option<bool> {
        lock(&self.membership)
            .peers
            .get(&role_id)
            .map(|peer| peer.requires_promise)
    }

    /// Marks whether a promise is required from a peer before sending it
    /// accept requests. Setting the value it already has changes nothing.
    pub fn set_promise_requirement(
        &self,
        role_id: RoleId,
        required: bool,
    ) -> Result<(), ClusterError> {
        let mut membership = lock(&self.membership);
        let peer = membership
            .peers
            .get_mut(&role_id)
            .ok_or(ClusterError::UnknownPeer(role_id))?;
        if peer.requires_promise == required {
            return Ok(());
        }

        peer.requires_promise = required;
        if required {
            membership.exempt_count -= 1;
        } else {
            membership.exempt_count += 1;
        }
        debug!(
            role_id,
            required,
            exempt = membership.exempt_count,
            "updated promise requirement"
        );
        Ok(())
    }
}

// Addresses this host is known by: its name plus everything the name
// resolves to.
fn local_addresses() -> Result<Vec<String>, ClusterError> {
    let name = hostname::get().map_err(ClusterError::Hostname)?;
    Ok(host_addresses(&name.to_string_lossy()))
}

// A name that does not resolve is still matched against the roster as is.
fn host_addresses(name: &str) -> Vec<String> {
    let mut addresses = vec![name.to_string()];
    match (name, 0).to_socket_addrs() {
        Ok(resolved) => {
            for address in resolved {
                let ip = address.ip().to_string();
                if !addresses.contains(&ip) {
                    addresses.push(ip);
                }
            }
        }
        Err(err) => debug!(host = name, %err, "could not resolve host name"),
    }
    addresses
}
