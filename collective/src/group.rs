use std::io;

use comms::{
    OnoReceiver, OnoSender,
    msg::{Command, Msg, Payload},
    specs::PeerSpec,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{CollectiveErr, CollectiveHandle, Result};

/// A collective as queued by the group's owner.
#[derive(Debug)]
enum Op {
    AllReduce(Vec<f32>),
    AllGather(Vec<f32>),
    Barrier,
    Disconnect,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::AllReduce(_) => "all_reduce",
            Op::AllGather(_) => "all_gather",
            Op::Barrier => "barrier",
            Op::Disconnect => "disconnect",
        }
    }
}

struct Request {
    op: Op,
    reply: oneshot::Sender<Result<Vec<f32>>>,
}

/// One rank's membership in a process group.
///
/// The connection to the hub is owned by a background task. Collectives are queued in
/// the order they are issued and hit the wire in that same order, so a collective
/// issued without waiting for it keeps making progress while the caller computes.
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    run_id: String,
    calls: u64,
    requests: mpsc::UnboundedSender<Request>,
    conn: JoinHandle<()>,
}

impl ProcessGroup {
    /// Joins the group through an already established connection to the hub.
    ///
    /// # Arguments
    /// * `rx` - The receiving end of the connection.
    /// * `tx` - The sending end of the connection.
    /// * `spec` - What this rank announces about itself.
    ///
    /// # Returns
    /// The group once the hub accepted every rank.
    pub async fn join<R, W>(
        mut rx: OnoReceiver<R>,
        mut tx: OnoSender<W>,
        spec: PeerSpec,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (rank, world_size) = (spec.rank, spec.world_size);
        tx.send(&Msg::Control(Command::Join(spec))).await?;

        let mut buf = Vec::new();
        let msg: Msg = rx.recv_into(&mut buf).await?;
        let run_id = match msg {
            Msg::Control(Command::Ready { run_id }) => run_id,
            Msg::Control(Command::Abort(abort)) => return Err(abort.into()),
            Msg::Err(text) => return Err(CollectiveErr::Remote(text.into_owned())),
            other => {
                return Err(CollectiveErr::Protocol(format!(
                    "expected ready, got {}",
                    other.kind()
                )));
            }
        };

        info!(rank = rank, world_size = world_size, run_id = run_id.as_str(); "joined the process group");

        let (requests, queue) = mpsc::unbounded_channel();
        let conn = tokio::spawn(serve(rank, rx, tx, buf, queue));

        Ok(Self {
            rank,
            world_size,
            run_id,
            calls: 0,
            requests,
            conn,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The identifier the hub chose for this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The amount of collectives issued through this group so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Issues an elementwise sum of `values` across every rank without waiting for it.
    ///
    /// # Arguments
    /// * `values` - This rank's contribution, every rank must contribute the same amount.
    ///
    /// # Returns
    /// A handle to wait for the sum.
    pub fn all_reduce_sum_async(&mut self, values: Vec<f32>) -> Result<CollectiveHandle> {
        self.calls += 1;
        self.issue(Op::AllReduce(values))
    }

    /// Sums `values` elementwise across every rank.
    pub async fn all_reduce_sum(&mut self, values: Vec<f32>) -> Result<Vec<f32>> {
        self.all_reduce_sum_async(values)?.wait().await
    }

    /// Collects every rank's `values`.
    ///
    /// # Returns
    /// The concatenation of every rank's values in rank order.
    pub async fn all_gather(&mut self, values: Vec<f32>) -> Result<Vec<f32>> {
        self.calls += 1;
        self.issue(Op::AllGather(values))?.wait().await
    }

    /// Waits until every rank reached this point.
    pub async fn barrier(&mut self) -> Result<()> {
        self.calls += 1;
        self.issue(Op::Barrier)?.wait().await?;
        Ok(())
    }

    /// Leaves the group once every rank asked to leave, then closes the connection.
    pub async fn shutdown(mut self) -> Result<()> {
        self.issue(Op::Disconnect)?.wait().await?;
        drop(self.requests);

        self.conn.await.map_err(io::Error::other)?;
        debug!(rank = self.rank; "left the process group");
        Ok(())
    }

    fn issue(&mut self, op: Op) -> Result<CollectiveHandle> {
        let name = op.name();
        let (reply, rx) = oneshot::channel();

        self.requests
            .send(Request { op, reply })
            .map_err(|_| CollectiveErr::Closed)?;

        Ok(CollectiveHandle::new(name, rx))
    }
}

/// Runs the queued collectives against the hub one after the other.
///
/// The first failure poisons the group, every later collective fails with it.
async fn serve<R, W>(
    rank: usize,
    mut rx: OnoReceiver<R>,
    mut tx: OnoSender<W>,
    mut buf: Vec<f32>,
    mut queue: mpsc::UnboundedReceiver<Request>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut failure: Option<String> = None;

    while let Some(Request { op, reply }) = queue.recv().await {
        let res = match &failure {
            Some(reason) => Err(CollectiveErr::Aborted(reason.clone())),
            None => exchange(&mut rx, &mut tx, &mut buf, &op).await,
        };

        if let Err(err) = &res
            && failure.is_none()
        {
            warn!(rank = rank, op = op.name(); "collective failed: {err}");
            failure = Some(err.to_string());
        }

        let finished = matches!(op, Op::Disconnect) && res.is_ok();
        if reply.send(res).is_err() {
            debug!(rank = rank, op = op.name(); "nobody waits for the collective anymore");
        }

        if finished {
            break;
        }
    }

    if let Err(err) = tx.shutdown().await {
        debug!(rank = rank; "closing the connection failed: {err}");
    }
}

/// Sends this rank's part of a collective and reads the hub's answer.
async fn exchange<R, W>(
    rx: &mut OnoReceiver<R>,
    tx: &mut OnoSender<W>,
    buf: &mut Vec<f32>,
    op: &Op,
) -> Result<Vec<f32>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = match op {
        Op::AllReduce(nums) => Msg::Data(Payload::Sum(nums)),
        Op::AllGather(nums) => Msg::Data(Payload::Gather(nums)),
        Op::Barrier => Msg::Control(Command::Barrier),
        Op::Disconnect => Msg::Control(Command::Disconnect),
    };
    if let Err(err) = tx.send(&msg).await {
        // The hub may have hung up right after telling why.
        return match rx.recv_into::<Msg, _>(buf).await {
            Ok(Msg::Control(Command::Abort(abort))) => Err(abort.into()),
            _ => Err(err.into()),
        };
    }

    let reply: Msg = rx.recv_into(buf).await?;
    match (op, reply) {
        (Op::AllReduce(nums), Msg::Data(Payload::Sum(sum))) if sum.len() == nums.len() => {
            Ok(sum.to_vec())
        }
        (Op::AllGather(_), Msg::Data(Payload::Gather(all))) => Ok(all.to_vec()),
        (Op::Barrier, Msg::Control(Command::Barrier))
        | (Op::Disconnect, Msg::Control(Command::Disconnect)) => Ok(Vec::new()),
        (_, Msg::Control(Command::Abort(abort))) => Err(abort.into()),
        (_, Msg::Err(text)) => Err(CollectiveErr::Remote(text.into_owned())),
        (op, other) => Err(CollectiveErr::Protocol(format!(
            "expected the answer to {}, got {}",
            op.name(),
            other.kind()
        ))),
    }
}
