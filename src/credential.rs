//! Client TLS credentials and the identity keys that partition pools.

use crate::resolve::Address;
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Opaque holder of a client-side TLS configuration.
///
/// A credential is used two ways: as a TLS wrapper factory for freshly dialed
/// streams, and as an identity that partitions idle pools — transports opened
/// under different credentials are never interchangeable.
pub struct Credential {
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl Credential {
    /// Credential that verifies the peer against the dialed IP address.
    pub fn new(config: Arc<rustls::ClientConfig>) -> Arc<Self> {
        Arc::new(Self {
            connector: TlsConnector::from(config),
            server_name: None,
        })
    }

    /// Credential that presents a fixed SNI name regardless of the dialed
    /// address, for upstreams fronted by name-routed load balancers.
    pub fn with_server_name(
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector: TlsConnector::from(config),
            server_name: Some(server_name),
        })
    }

    /// Identity key for this credential. Distinct credential instances get
    /// distinct keys even when built from the same `ClientConfig`.
    pub fn key(this: &Arc<Credential>) -> CredentialKey {
        CredentialKey::Identity(Arc::as_ptr(this) as usize)
    }

    pub(crate) async fn wrap(
        &self,
        stream: TcpStream,
        address: &Address,
    ) -> io::Result<TlsStream<TcpStream>> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::IpAddress(address.ip.into()),
        };
        self.connector.connect(name, stream).await
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Key selecting the idle pool for a transport.
///
/// `Anonymous` is the sentinel for plaintext transports; it compares equal
/// only to itself. `Identity` carries the credential's pointer identity, so
/// the key is only meaningful while the credential is alive — the pool table
/// prunes entries whose credential has been dropped before reusing a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Anonymous,
    Identity(usize),
}

/// How a caller asks for TLS on `get_connection`.
#[derive(Debug, Clone, Default)]
pub enum CredentialSpec {
    /// Plaintext transport.
    #[default]
    None,
    /// Wrap with the context's default credential; plaintext when the
    /// context has none configured.
    Ambient,
    /// Wrap with this specific credential.
    Explicit(Arc<Credential>),
}
