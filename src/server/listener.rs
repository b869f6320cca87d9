//! OS listener handles for path and TCP addresses

use crate::address::ListenAddr;
use std::io;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A bound, listening OS handle
#[derive(Debug)]
pub enum BoundListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// An accepted connection
#[derive(Debug)]
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// Bind a listener for the given address
pub async fn bind(address: &ListenAddr) -> io::Result<BoundListener> {
    match address {
        ListenAddr::Path(path) => Ok(BoundListener::Unix(UnixListener::bind(path)?)),
        ListenAddr::Inet(addr) => Ok(BoundListener::Tcp(TcpListener::bind(addr).await?)),
    }
}

impl BoundListener {
    /// Address actually bound; TCP port 0 resolves to the assigned port
    pub fn local_addr(&self, requested: &ListenAddr) -> ListenAddr {
        match self {
            BoundListener::Unix(_) => requested.clone(),
            BoundListener::Tcp(listener) => listener
                .local_addr()
                .map(ListenAddr::Inet)
                .unwrap_or_else(|_| requested.clone()),
        }
    }

    /// Accept the next connection
    pub async fn accept(&self) -> io::Result<Connection> {
        match self {
            BoundListener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            BoundListener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::Tcp(stream))
            }
        }
    }
}
