//! Out-of-band connection setup: every QP's identifiers travel over a TCP control connection,
//! both sides drive their QP to Ready-to-Send, then meet at a rendezvous before any data path
//! traffic is posted.
pub mod bring_up;
pub mod channel;
pub mod qp_info;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};

use tracing::{debug, info};

use self::bring_up::{bring_up, Endpoint, LinkParams};
use self::channel::ControlChannel;
use self::qp_info::QpInfo;
use crate::ibverbs::queue_pair::ModifyQueuePairError;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("failed to listen on control port {port}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept control connection")]
    Accept(#[source] io::Error),
    #[error("failed to connect to {host}:{port}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("control channel with {peer} failed")]
    Channel {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{peer} declared rank {rank} but only {num_peers} peers are expected")]
    RankOutOfRange { peer: SocketAddr, rank: u32, num_peers: usize },
    #[error("{peer} declared rank {rank} which is already connected")]
    DuplicateRank { peer: SocketAddr, rank: u32 },
    #[error("{peer} answered with rank {actual}, expected {expected}")]
    UnexpectedRank {
        peer: SocketAddr,
        expected: usize,
        actual: u32,
    },
    #[error("failed to connect the queue pair of peer {rank}")]
    BringUp {
        rank: usize,
        #[source]
        source: ModifyQueuePairError,
    },
    #[error("{peer} sent an unexpected rendezvous token")]
    BadSyncToken { peer: SocketAddr },
}

fn channel_error(peer: SocketAddr) -> impl FnOnce(io::Error) -> HandshakeError {
    move |source| HandshakeError::Channel { peer, source }
}

/// The server's listening control socket.
#[derive(Debug)]
pub struct HandshakeListener {
    inner: TcpListener,
}

impl HandshakeListener {
    /// Listen on every local address, IPv6 first with a fallback to IPv4 only hosts.
    pub fn bind(port: u16) -> Result<Self, HandshakeError> {
        TcpListener::bind((Ipv6Addr::UNSPECIFIED, port))
            .or_else(|_| TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)))
            .map(|inner| HandshakeListener { inner })
            .map_err(|source| HandshakeError::Bind { port, source })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Server side: accept one connection per endpoint, in any order, and pair each client with the
/// endpoint at the index of its declared rank. Returns the clients' records indexed by rank.
pub fn serve<E: Endpoint>(
    listener: &HandshakeListener, endpoints: &mut [E], link: &LinkParams,
) -> Result<Vec<QpInfo>, HandshakeError> {
    let num_peers = endpoints.len();
    let mut joined: Vec<Option<(ControlChannel, QpInfo)>> = (0..num_peers).map(|_| None).collect();

    for _ in 0..num_peers {
        let (stream, peer) = listener.inner.accept().map_err(HandshakeError::Accept)?;
        let mut channel = ControlChannel::new(stream).map_err(channel_error(peer))?;
        let remote = channel.recv_info().map_err(channel_error(peer))?;

        let rank = remote.rank;
        match joined.get_mut(rank as usize) {
            None => return Err(HandshakeError::RankOutOfRange { peer, rank, num_peers }),
            Some(Some(_)) => return Err(HandshakeError::DuplicateRank { peer, rank }),
            Some(slot) => *slot = Some((channel, remote)),
        }
        info!(%peer, rank, "client joined");
    }

    // num_peers distinct ranks below num_peers: every slot is filled, in rank order.
    let mut channels = Vec::with_capacity(num_peers);
    let mut remotes = Vec::with_capacity(num_peers);
    for (rank, ((mut channel, remote), endpoint)) in joined.into_iter().flatten().zip(endpoints.iter_mut()).enumerate() {
        let peer = channel.peer_addr();
        channel.send_info(&endpoint.local_info()).map_err(channel_error(peer))?;
        bring_up(endpoint, &remote, link).map_err(|source| HandshakeError::BringUp { rank, source })?;
        channels.push(channel);
        remotes.push(remote);
    }

    for channel in &mut channels {
        rendezvous(channel)?;
    }
    Ok(remotes)
}

/// Client side: connect to every server in rank order, send our record first, then connect the
/// QP with the server's answer.
pub fn join<E: Endpoint>(
    servers: &[String], port: u16, endpoints: &mut [E], link: &LinkParams,
) -> Result<Vec<QpInfo>, HandshakeError> {
    let mut remotes = Vec::with_capacity(servers.len());

    for (rank, (host, endpoint)) in servers.iter().zip(endpoints.iter_mut()).enumerate() {
        let mut channel = ControlChannel::connect(host, port).map_err(|source| HandshakeError::Connect {
            host: host.clone(),
            port,
            source,
        })?;
        let peer = channel.peer_addr();

        channel.send_info(&endpoint.local_info()).map_err(channel_error(peer))?;
        let remote = channel.recv_info().map_err(channel_error(peer))?;
        if remote.rank as usize != rank {
            return Err(HandshakeError::UnexpectedRank {
                peer,
                expected: rank,
                actual: remote.rank,
            });
        }

        bring_up(endpoint, &remote, link).map_err(|source| HandshakeError::BringUp { rank, source })?;
        rendezvous(&mut channel)?;
        info!(%peer, rank, "joined server");
        remotes.push(remote);
    }
    Ok(remotes)
}

fn rendezvous(channel: &mut ControlChannel) -> Result<(), HandshakeError> {
    let peer = channel.peer_addr();
    if channel.sync().map_err(channel_error(peer))? {
        debug!(%peer, "rendezvous done");
        Ok(())
    } else {
        Err(HandshakeError::BadSyncToken { peer })
    }
}

#[cfg(test)]
mod tests {
    use super::bring_up::tests::{link, FakeEndpoint};
    use super::*;
    use crate::ibverbs::queue_pair::QueuePairState;
    use std::thread;

    fn info(qp_num: u32, rank: u32) -> QpInfo {
        QpInfo {
            lid: 1,
            qp_num,
            rkey: qp_num + 1,
            raddr: 0x1000 * u64::from(qp_num),
            rank,
        }
    }

    fn spawn_client(port: u16, rank: u32) -> thread::JoinHandle<Result<(Vec<QpInfo>, FakeEndpoint), HandshakeError>> {
        thread::spawn(move || {
            let mut endpoints = [FakeEndpoint::new(info(100 + rank, rank))];
            let remotes = join(&["localhost".to_string()], port, &mut endpoints, &link())?;
            let [endpoint] = endpoints;
            Ok((remotes, endpoint))
        })
    }

    #[test]
    fn test_server_pairs_three_clients_by_rank() {
        let listener = HandshakeListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let clients: Vec<_> = [2, 0, 1].into_iter().map(|rank| spawn_client(port, rank)).collect();

        let mut endpoints: Vec<_> = (0..3).map(|i| FakeEndpoint::new(info(10 + i, 0))).collect();
        let remotes = serve(&listener, &mut endpoints, &link()).unwrap();

        assert_eq!(remotes.len(), 3);
        for (rank, (remote, endpoint)) in remotes.iter().zip(&endpoints).enumerate() {
            assert_eq!(remote.rank as usize, rank);
            assert_eq!(endpoint.dest_qp_num, Some(100 + rank as u32));
            assert_eq!(
                endpoint.history,
                vec![
                    QueuePairState::Reset,
                    QueuePairState::Init,
                    QueuePairState::ReadyToReceive,
                    QueuePairState::ReadyToSend,
                ]
            );
        }

        for (client, rank) in clients.into_iter().zip([2u32, 0, 1]) {
            let (remotes, endpoint) = client.join().unwrap().unwrap();
            assert_eq!(remotes, vec![info(10 + rank, 0)]);
            assert_eq!(endpoint.state, QueuePairState::ReadyToSend);
            assert_eq!(endpoint.dest_qp_num, Some(10 + rank));
        }
    }

    #[test]
    fn test_duplicate_rank_aborts() {
        let listener = HandshakeListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let clients: Vec<_> = [0, 0].into_iter().map(|rank| spawn_client(port, rank)).collect();
        let mut endpoints: Vec<_> = (0..2).map(|i| FakeEndpoint::new(info(10 + i, 0))).collect();

        let err = serve(&listener, &mut endpoints, &link()).unwrap_err();
        assert!(matches!(err, HandshakeError::DuplicateRank { rank: 0, .. }));
        drop(listener);

        // neither client can finish once the server gave up
        for client in clients {
            assert!(client.join().unwrap().is_err());
        }
        assert!(endpoints.iter().all(|endpoint| endpoint.state == QueuePairState::Reset));
    }

    #[test]
    fn test_rank_out_of_range_aborts() {
        let listener = HandshakeListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = spawn_client(port, 5);
        let mut endpoints = vec![FakeEndpoint::new(info(10, 0))];

        let err = serve(&listener, &mut endpoints, &link()).unwrap_err();
        assert!(matches!(err, HandshakeError::RankOutOfRange { rank: 5, num_peers: 1, .. }));
        assert!(client.join().unwrap().is_err());
    }

    #[test]
    fn test_client_checks_server_rank() {
        let listener = HandshakeListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.inner.accept().unwrap();
            let mut channel = ControlChannel::new(stream).unwrap();
            channel.recv_info().unwrap();
            channel.send_info(&info(10, 3)).unwrap();
        });

        let err = spawn_client(port, 0).join().unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedRank { expected: 0, actual: 3, .. }));
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = HandshakeListener::bind(0).unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut endpoints = [FakeEndpoint::new(info(1, 0))];
        let err = join(&["localhost".to_string()], port, &mut endpoints, &link()).unwrap_err();
        assert!(matches!(err, HandshakeError::Connect { .. }));
    }
}
