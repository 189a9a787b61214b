use std::io;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Abort, Command, Msg, Payload},
    specs::PeerSpec,
};
use futures::future;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{CollectiveErr, Result};

/// The receiving side of one rank's connection together with its scratch buffer.
struct Peer<R: AsyncRead + Unpin> {
    rank: usize,
    rx: OnoReceiver<R>,
    buf: Vec<f32>,
}

/// How a round ends once every rank's message was read.
#[derive(Debug)]
enum Outcome {
    Sum,
    Gather,
    Barrier,
    Disconnect,
    Abort(Abort),
}

/// Serves collective rounds for a whole process group, it runs on rank 0.
///
/// The receiving halves and the sending halves of the connections are kept apart so
/// that the messages read in a round can borrow the former while the latter answer.
pub struct Hub<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    peers: Vec<Peer<R>>,
    txs: Vec<OnoSender<W>>,
    out: Vec<f32>,
    run_id: String,
    rounds: u64,
}

impl<R, W> Hub<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Forms the process group out of one connection per rank.
    ///
    /// Waits for every rank's `Join`, checks that the ranks are unique and in range and
    /// that every rank was started with the same configuration, then answers all of
    /// them with `Ready`.
    ///
    /// # Arguments
    /// * `links` - One connection per rank, in any order.
    /// * `world_size` - The amount of ranks of the group.
    /// * `run_id` - The identifier of this run, shared with every rank.
    ///
    /// # Returns
    /// The hub ready to serve rounds, or the reason the group was refused.
    pub async fn form(
        links: Vec<(OnoReceiver<R>, OnoSender<W>)>,
        world_size: usize,
        run_id: String,
    ) -> Result<Self> {
        let (rxs, mut txs): (Vec<_>, Vec<_>) = links.into_iter().unzip();
        let mut peers: Vec<_> = rxs
            .into_iter()
            .map(|rx| Peer {
                rank: 0,
                rx,
                buf: Vec::new(),
            })
            .collect();

        let joins = peers.iter_mut().map(recv_join);

        let specs = match future::try_join_all(joins).await {
            Ok(specs) => specs,
            Err(err) => {
                let reason = err.to_string();
                abort(&mut txs, Abort::Rejected { reason }).await;
                return Err(err);
            }
        };

        if let Err(reason) = check_specs(&specs, world_size) {
            abort(&mut txs, Abort::Rejected { reason: reason.clone() }).await;
            return Err(CollectiveErr::Rendezvous(reason));
        }

        let mut ranked: Vec<_> = specs
            .iter()
            .map(|spec| spec.rank)
            .zip(peers.into_iter().zip(txs))
            .collect();
        ranked.sort_by_key(|(rank, _)| *rank);

        let (peers, mut txs): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .map(|(rank, (mut peer, tx))| {
                peer.rank = rank;
                (peer, tx)
            })
            .unzip();

        let ready = Msg::Control(Command::Ready {
            run_id: run_id.clone(),
        });
        broadcast(&mut txs, &ready).await?;

        info!(world_size = world_size, run_id = run_id.as_str(); "process group formed");

        Ok(Self {
            peers,
            txs,
            out: Vec::new(),
            run_id,
            rounds: 0,
        })
    }

    /// The identifier of the run this hub serves.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Serves rounds until every rank disconnects.
    ///
    /// # Returns
    /// An error if the group had to be aborted.
    pub async fn run(mut self) -> Result<()> {
        while self.round().await? {}

        info!(rounds = self.rounds; "process group closed");
        Ok(())
    }

    /// Serves a single collective round.
    ///
    /// # Returns
    /// Whether the group is still alive after this round.
    async fn round(&mut self) -> Result<bool> {
        let Self {
            peers,
            txs,
            out,
            rounds,
            ..
        } = self;

        let recvs = peers.iter_mut().map(|peer| async move {
            let rank = peer.rank;
            peer.rx
                .recv_into::<Msg, _>(&mut peer.buf)
                .await
                .map_err(|err| {
                    warn!(rank = rank; "lost the connection to rank: {err}");
                    rank
                })
        });

        let msgs = match future::try_join_all(recvs).await {
            Ok(msgs) => msgs,
            Err(rank) => {
                abort(txs, Abort::PeerLost { rank }).await;
                return Err(CollectiveErr::PeerLost { rank });
            }
        };

        let outcome = combine(&msgs, out);
        *rounds += 1;
        let kind = msgs.first().map(Msg::kind).unwrap_or_default();
        debug!(round = *rounds, kind = kind; "serving round");

        let reply = match outcome {
            Outcome::Sum => Msg::Data(Payload::Sum(&out[..])),
            Outcome::Gather => Msg::Data(Payload::Gather(&out[..])),
            Outcome::Barrier => Msg::Control(Command::Barrier),
            Outcome::Disconnect => Msg::Control(Command::Disconnect),
            Outcome::Abort(reason) => {
                let err = CollectiveErr::from(reason.clone());
                warn!("aborting the process group: {err}");
                abort(txs, reason).await;
                return Err(err);
            }
        };

        broadcast(txs, &reply).await?;
        Ok(!matches!(reply, Msg::Control(Command::Disconnect)))
    }
}

/// Waits for the `Join` a rank sends right after connecting.
async fn recv_join<R: AsyncRead + Unpin>(peer: &mut Peer<R>) -> Result<PeerSpec> {
    let msg: Msg = peer.rx.recv_into(&mut peer.buf).await?;
    match msg {
        Msg::Control(Command::Join(spec)) => Ok(spec),
        other => Err(CollectiveErr::Protocol(format!(
            "expected a join, got {}",
            other.kind()
        ))),
    }
}

/// Validates every rank's announcement against the expected group.
fn check_specs(specs: &[PeerSpec], world_size: usize) -> std::result::Result<(), String> {
    if specs.len() != world_size {
        return Err(format!(
            "{} ranks joined a group of {world_size}",
            specs.len()
        ));
    }

    let mut seen = vec![false; world_size];
    for spec in specs {
        if spec.world_size != world_size {
            return Err(format!(
                "rank {} expects a group of {}, the hub serves {world_size}",
                spec.rank, spec.world_size
            ));
        }

        match seen.get_mut(spec.rank) {
            Some(true) => return Err(format!("rank {} joined twice", spec.rank)),
            Some(slot) => *slot = true,
            None => return Err(format!("rank {} is out of range", spec.rank)),
        }
    }

    match specs.split_first() {
        Some((first, rest)) => match rest.iter().find_map(|spec| first.disagreement(spec)) {
            Some(reason) => Err(reason),
            None => Ok(()),
        },
        None => Ok(()),
    }
}

/// Combines the messages of a round, given in rank order, into `out`.
fn combine(msgs: &[Msg<'_>], out: &mut Vec<f32>) -> Outcome {
    let Some(first) = msgs.first() else {
        return Outcome::Disconnect;
    };

    let expected = first.kind();
    if let Some((rank, msg)) = msgs
        .iter()
        .enumerate()
        .find(|(_, msg)| msg.kind() != expected)
    {
        return Outcome::Abort(Abort::Desync {
            rank,
            expected: expected.to_string(),
            got: msg.kind().to_string(),
        });
    }

    match first {
        Msg::Data(payload) => {
            let (op, len) = match payload {
                Payload::Sum(nums) => ("all_reduce", nums.len()),
                Payload::Gather(nums) => ("all_gather", nums.len()),
            };

            let mut contributions = Vec::with_capacity(msgs.len());
            for (rank, msg) in msgs.iter().enumerate() {
                let nums = match msg {
                    Msg::Data(payload) => payload.values(),
                    other => {
                        return Outcome::Abort(Abort::Desync {
                            rank,
                            expected: expected.to_string(),
                            got: other.kind().to_string(),
                        });
                    }
                };

                if nums.len() != len {
                    return Outcome::Abort(Abort::ShapeMismatch {
                        op: op.to_string(),
                        rank,
                        got: nums.len(),
                        expected: len,
                    });
                }

                contributions.push(nums);
            }

            out.clear();
            match payload {
                Payload::Sum(head) => {
                    out.extend_from_slice(head);
                    for nums in &contributions[1..] {
                        out.iter_mut().zip(*nums).for_each(|(acc, x)| *acc += x);
                    }

                    Outcome::Sum
                }
                Payload::Gather(_) => {
                    contributions.iter().for_each(|nums| out.extend_from_slice(nums));
                    Outcome::Gather
                }
            }
        }
        Msg::Control(Command::Barrier) => Outcome::Barrier,
        Msg::Control(Command::Disconnect) => Outcome::Disconnect,
        other => Outcome::Abort(Abort::Rejected {
            reason: format!("{} is not a collective", other.kind()),
        }),
    }
}

/// Sends the same message to every rank.
async fn broadcast<W: AsyncWrite + Unpin>(txs: &mut [OnoSender<W>], msg: &Msg<'_>) -> io::Result<()> {
    let sends = txs.iter_mut().map(|tx| tx.send(msg));
    future::try_join_all(sends).await?;
    Ok(())
}

/// Tells every rank still reachable that the group is over.
async fn abort<W: AsyncWrite + Unpin>(txs: &mut [OnoSender<W>], reason: Abort) {
    let msg = Msg::Control(Command::Abort(reason));
    let sends = txs.iter_mut().map(|tx| tx.send(&msg));

    for res in future::join_all(sends).await {
        if let Err(err) = res {
            debug!("could not deliver the abort: {err}");
        }
    }
}
