//! Ways of bringing a process group together.

use std::time::Duration;

use comms::specs::PeerSpec;
use futures::future;
use log::{debug, info};
use tokio::{
    io::{DuplexStream, ReadHalf, WriteHalf},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{CollectiveErr, Hub, ProcessGroup, Result};

const RETRY_DELAY: Duration = Duration::from_millis(200);
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// A hub served over tcp.
pub type TcpHub = Hub<OwnedReadHalf, OwnedWriteHalf>;

/// A hub served over in-memory streams.
pub type LocalHub = Hub<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Creates the identifier of a new run out of the local time, e.g. `20250131_174502`.
pub fn new_run_id() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Binds `addr` and serves the group from a background task.
///
/// The listener is bound before returning so ranks may start connecting right away.
///
/// # Arguments
/// * `addr` - The rendezvous address, `host:port`.
/// * `world_size` - The amount of ranks to wait for.
///
/// # Returns
/// The task serving the group, it completes once every rank disconnected.
pub async fn host(addr: &str, world_size: usize) -> Result<JoinHandle<Result<()>>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| CollectiveErr::Rendezvous(format!("could not bind {addr}: {err}")))?;

    info!(addr = addr, world_size = world_size; "hosting the process group");

    Ok(tokio::spawn(async move {
        accept(listener, world_size).await?.run().await
    }))
}

/// Accepts one connection per rank and forms the group out of them.
pub async fn accept(listener: TcpListener, world_size: usize) -> Result<TcpHub> {
    let mut links = Vec::with_capacity(world_size);

    while links.len() < world_size {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!(peer = peer.to_string().as_str(); "accepted a connection");

        let (rx, tx) = stream.into_split();
        links.push(comms::channel(rx, tx));
    }

    Hub::form(links, world_size, new_run_id()).await
}

/// Connects to the hub at `addr` and joins its group.
///
/// The hub may not be listening yet, connecting is retried until `timeout` elapses.
///
/// # Arguments
/// * `addr` - The rendezvous address, `host:port`.
/// * `spec` - What this rank announces about itself.
/// * `timeout` - How long to keep trying to reach the hub.
pub async fn connect(addr: &str, spec: PeerSpec, timeout: Duration) -> Result<ProcessGroup> {
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(err) if Instant::now() < deadline => {
                debug!(addr = addr; "hub not reachable yet: {err}");
                time::sleep(RETRY_DELAY).await;
            }
            Err(err) => {
                return Err(CollectiveErr::Rendezvous(format!(
                    "could not reach {addr} within {timeout:?}: {err}"
                )));
            }
        }
    };

    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);

    ProcessGroup::join(rx, tx, spec).await
}

/// Forms a group whose ranks all live in this process, connected by in-memory streams.
///
/// # Arguments
/// * `specs` - One announcement per rank.
///
/// # Returns
/// Every rank's group, in the order of `specs`, and the task serving them.
pub async fn in_memory(specs: Vec<PeerSpec>) -> Result<(Vec<ProcessGroup>, JoinHandle<Result<()>>)> {
    let world_size = specs.len();
    let mut hub_links = Vec::with_capacity(world_size);
    let mut rank_links = Vec::with_capacity(world_size);

    for _ in 0..world_size {
        let (hub_end, rank_end) = tokio::io::duplex(DUPLEX_CAPACITY);

        let (rx, tx) = tokio::io::split(hub_end);
        hub_links.push(comms::channel(rx, tx));

        let (rx, tx) = tokio::io::split(rank_end);
        rank_links.push(comms::channel(rx, tx));
    }

    let hub = tokio::spawn(async move {
        let hub: LocalHub = Hub::form(hub_links, world_size, new_run_id()).await?;
        hub.run().await
    });

    let joins = rank_links
        .into_iter()
        .zip(specs)
        .map(|((rx, tx), spec)| ProcessGroup::join(rx, tx, spec));

    let groups = future::try_join_all(joins).await?;
    Ok((groups, hub))
}
