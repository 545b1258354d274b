use crate::{Error, Params};
use std::net::Ipv4Addr;

/// An (ipv4, port) pair identifying either a local bind point or a remote
/// peer.
///
/// Ordering is lexicographic on `(ip, port)`, matching the wire comparison
/// used to key the router's waitlist. The default value, `(0, 0)`, is the
/// *wildcard address* used by `accept` to match a handshake from any peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address {
    pub ip: u32,
    pub port: u16,
}

impl Address {
    pub const WILDCARD: Address = Address { ip: 0, port: 0 };

    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ip)
    }

    /// Builds an [`Address`] from a `{"ip": "...", "port": "..."}` mapping.
    ///
    /// ```
    /// use frame::{Address, Params};
    ///
    /// let mut params = Params::new();
    /// params.insert("ip".into(), "127.0.0.1".into());
    /// params.insert("port".into(), "26258".into());
    ///
    /// let addr = Address::from_params(&params).unwrap();
    /// assert_eq!(addr.port, 26258);
    /// assert_eq!(addr.ipv4(), std::net::Ipv4Addr::new(127, 0, 0, 1));
    /// ```
    pub fn from_params(params: &Params) -> Result<Self, Error> {
        let ip_str = params
            .get("ip")
            .ok_or_else(|| Error::IncorrectParameter("missing `ip`".into()))?;

        let ip: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| Error::IncorrectParameter(format!("malformed ip `{ip_str}`")))?;

        let port_str = params
            .get("port")
            .ok_or_else(|| Error::IncorrectParameter("missing `port`".into()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| Error::IncorrectParameter(format!("malformed port `{port_str}`")))?;

        Ok(Self {
            ip: u32::from(ip),
            port,
        })
    }

    pub fn to_socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ipv4().into(), self.port)
    }
}

impl From<std::net::SocketAddrV4> for Address {
    fn from(value: std::net::SocketAddrV4) -> Self {
        Self {
            ip: u32::from(*value.ip()),
            port: value.port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_lexicographically_on_ip_then_port() {
        let a = Address::new(1, 100);
        let b = Address::new(1, 200);
        let c = Address::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn wildcard_is_zero_zero() {
        assert!(Address::WILDCARD.is_wildcard());
        assert!(Address::default().is_wildcard());
        assert!(!Address::new(1, 0).is_wildcard());
    }

    #[test]
    fn from_params_rejects_malformed_ip() {
        let mut params = Params::new();
        params.insert("ip".into(), "not-an-ip".into());
        params.insert("port".into(), "80".into());
        assert!(matches!(
            Address::from_params(&params),
            Err(Error::IncorrectParameter(_))
        ));
    }
}
