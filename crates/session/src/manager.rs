use ahash::HashMapExt;
use frame::{Address, Error, Options, Params};
use parking_lot::Mutex;
use protocol::Protocol;
use router::Router;
use std::sync::Arc;
use transport::UdpTransport;

use crate::session::Session;

/// Shares one `(UdpTransport, Router)` pair per distinct local bind
/// address across however many sessions connect or accept through it.
pub struct SessionManager {
    options: Options,
    endpoints: Mutex<ahash::HashMap<Address, Arc<Router>>>,
}

impl SessionManager {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            endpoints: Mutex::new(ahash::HashMap::new()),
        }
    }

    /// Initiates a session: handshakes with `remote` over the (possibly
    /// shared) local endpoint named by `local_config`.
    pub fn connect(&self, local_config: &Params, remote: Address, timeout_ms: u64) -> Result<Session, Error> {
        let (router, local) = self.endpoint_for(local_config)?;
        let protocol = Protocol::new(router, self.options, hostname_of(local_config));
        protocol.connect(local, remote, timeout_ms)?;
        Ok(Session::new(protocol, local_config.clone(), remote))
    }

    /// Waits for a handshake on the local endpoint named by
    /// `local_config`. If `remote` is the wildcard address, accepts from
    /// any peer; the returned session's `config()` reports the learned
    /// peer.
    pub fn accept(&self, local_config: &Params, remote: Address, timeout_ms: u64) -> Result<Session, Error> {
        let (router, local) = self.endpoint_for(local_config)?;
        let protocol = Protocol::new(router, self.options, hostname_of(local_config));
        let actual_remote = protocol.accept(local, remote, timeout_ms)?;
        Ok(Session::new(protocol, local_config.clone(), actual_remote))
    }

    fn endpoint_for(&self, local_config: &Params) -> Result<(Arc<Router>, Address), Error> {
        let local = Address::from_params(local_config)?;

        let mut endpoints = self.endpoints.lock();
        if let Some(router) = endpoints.get(&local) {
            return Ok((router.clone(), local));
        }

        let transport = Arc::new(UdpTransport::enable(local_config)?);
        let router = Arc::new(Router::new(transport, self.options));
        endpoints.insert(local, router.clone());
        log::debug!("session manager: bound new endpoint at {:?}", local);

        Ok((router, local))
    }
}

fn hostname_of(config: &Params) -> String {
    config.get("hostname").cloned().unwrap_or_else(|| "sprot".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_the_same_router_for_the_same_local_address() {
        let manager = SessionManager::new(Options::default());
        let mut cfg = Params::new();
        cfg.insert("ip".into(), "127.0.0.1".into());
        cfg.insert("port".into(), "0".into());

        let (first, _) = manager.endpoint_for(&cfg).unwrap();
        let (second, _) = manager.endpoint_for(&cfg).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }
}
