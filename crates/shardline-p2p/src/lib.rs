// === Wire ===
pub mod frame_codec;
pub mod packet;

// === Connections ===
pub mod peer_socket;
pub mod discovery;

pub use discovery::{dial_targets, should_dial, PeerDirectory};
pub use frame_codec::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_LEN};
pub use packet::{Packet, PacketError};
pub use peer_socket::{run_reader, HandshakeError, PacketHandler, PeerSocket, SocketReader, HANDSHAKE_TIMEOUT};
