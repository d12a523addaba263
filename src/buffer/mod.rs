pub mod buffer;

pub use buffer::{BufferError, PacketBuffer, VectorPacketBuffer};
