use crate::{
    error::CallError,
    message::{Request, Response},
};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

// Channel is an open connection to one peer. Calls block until the peer
// answers or the connection fails; several calls may be in flight at once and
// each one receives its own response.
pub trait Channel: Send + Sync {
    fn call(&self, request: Request) -> Result<Response, CallError>;
}

// RequestHandler serves requests that arrive from peers. It is called from
// many threads at once. An Err is sent back to the caller as a rejection.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request) -> Result<Response, String>;
}

// Transport provides the means of communication of a node with the rest of
// the cluster. It is up to the user how the bytes travel; the crate ships a
// TCP implementation in the tcp module.
pub trait Transport: Send + Sync {
    // Opens a channel to the peer listening at address:port.
    fn dial(&self, address: &str, port: u16) -> Result<Arc<dyn Channel>, io::Error>;

    // Starts serving inbound connections at address:port in the background
    // and returns the address actually bound. Must not block.
    fn listen(
        &self,
        address: &str,
        port: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<SocketAddr, io::Error>;
}

// A panic while holding one of the crate's locks leaves the guarded data
// consistent, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
