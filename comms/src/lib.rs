//! Length-prefixed application protocol spoken between ranks and the rendezvous hub.

mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::{Align1, Align4};
pub use deserialize::Deserialize;
pub use receiver::OnoReceiver;
pub use sender::OnoSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames bigger than this are rejected before allocating for them.
const MAX_FRAME_LEN: usize = 1 << 30;

/// Wraps the two halves of a connection into a framed receiver and sender.
///
/// # Arguments
/// * `rx` - The reading half, e.g. a tcp read half or a duplex stream.
/// * `tx` - The writing half.
pub fn channel<R, W>(rx: R, tx: W) -> (OnoReceiver<R>, OnoSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (OnoReceiver::new(rx), OnoSender::new(tx))
}
