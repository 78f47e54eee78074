//! Message and queue transport.
//!
//! Containers share nothing but queues. A container blocks on one
//! [`WaitChannel`]; each queue it consumes is bound to one bit of that
//! channel. Data between containers travels as [`DataMessage`]s whose
//! buffers return to the sender's [`BufferPool`] when dropped.

mod data;
mod queue;
mod signal;

pub use data::{BufferFlags, BufferPool, DataBuffer, DataMessage, Marker, PooledBuf};
pub use queue::{QueueReceiver, QueueSender, queue};
pub use signal::{CHANNEL_BITS, ChannelMask, Signal, WaitChannel};
