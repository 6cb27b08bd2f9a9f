//! Wire protocol shared by sensor senders, the relay and receivers.
//!
//! Every frame on the wire occupies a fixed [`FRAME_LEN`] window: the variant's own
//! bytes (node id, command, payload, CRC4 nibble, XOR checksum, `0xFF` terminator)
//! followed by zero padding.

pub mod crc;
pub mod frame;
pub mod io;
pub mod role;
pub mod shutdown;

pub use frame::{decode, Frame, FrameError, FrameKind, Payload};
pub use io::{read_frame, read_full, read_raw_frame, write_full, RawFrame, ReadError};
pub use role::Role;
pub use shutdown::{shutdown_requested, Shutdown};

/// Size of every frame window on the wire, and of every broadcast.
pub const FRAME_LEN: usize = 32;

/// Size of the role tag exchanged once at connection start.
pub const ROLE_LEN: usize = 2;

/// Final byte of every variant.
pub const END_SYMBOL: u8 = 0xFF;
