use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize, specs::PeerSpec};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR: Header = 0;
const CONTROL: Header = 1;
const SUM: Header = 2;
const GATHER: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
///
/// The same variant is used for a rank's contribution and for the hub's answer.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Elementwise sum across every rank.
    Sum(&'a [f32]),
    /// Rank ordered concatenation of every rank's values.
    Gather(&'a [f32]),
}

impl Payload<'_> {
    /// Returns the numbers carried by this payload.
    pub fn values(&self) -> &[f32] {
        match self {
            Payload::Sum(nums) | Payload::Gather(nums) => nums,
        }
    }
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message of every rank, announcing who it is.
    Join(PeerSpec),
    /// The hub's answer once every rank joined.
    Ready { run_id: String },
    Barrier,
    Disconnect,
    /// The hub gave up on the group, every rank must stop.
    Abort(Abort),
}

/// Why the hub tore the group down.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Abort {
    /// A rank's connection failed while the others waited on a collective.
    PeerLost { rank: usize },
    /// A rank contributed a different amount of values than rank 0.
    ShapeMismatch {
        op: String,
        rank: usize,
        got: usize,
        expected: usize,
    },
    /// A rank issued a different collective than rank 0 in the same round.
    Desync {
        rank: usize,
        expected: String,
        got: String,
    },
    /// The group could not be formed.
    Rejected { reason: String },
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// Returns a short name for the kind of this message, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Join(_)) => "control/join",
            Msg::Control(Command::Ready { .. }) => "control/ready",
            Msg::Control(Command::Barrier) => "control/barrier",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Control(Command::Abort(_)) => "control/abort",
            Msg::Data(Payload::Sum(_)) => "data/sum",
            Msg::Data(Payload::Gather(_)) => "data/gather",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(payload) => {
                let (kind, nums) = match payload {
                    Payload::Sum(nums) => (SUM, nums),
                    Payload::Gather(nums) => (GATHER, nums),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                Ok(Some(bytemuck::cast_slice(nums)))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at_mut(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);

        match Header::from_be_bytes(header) {
            ERR => {
                let text = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(text)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            kind @ (SUM | GATHER) => {
                let nums: &[f32] = bytemuck::try_cast_slice_mut::<u8, f32>(rest).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Received a malformed numeric payload: {err:?}"),
                    )
                })?;

                let payload = if kind == SUM {
                    Payload::Sum(nums)
                } else {
                    Payload::Gather(nums)
                };

                Ok(Self::Data(payload))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
