//! fxcode-core: Shared protocol library for the fxcode session server.
//!
//! Provides CBOR frame types and codec, the socket transport, sequenced
//! (replayable) delivery state, resource URI transforms and a
//! reference-counted event emitter.

pub mod codec;
pub mod error;
pub mod event;
pub mod messages;
pub mod protocol;
pub mod transport;
pub mod uri;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode, frame_encode, FrameDecoder};
pub use error::{FxError, FxResult};
pub use event::{Emitter, Listener, WeakEmitter};
pub use messages::{
    Buffer, ChannelRequest, ChannelResponse, ConnectionType, ErrorPayload, Frame, HandshakeOk,
    HandshakeRequest, Payload,
};
pub use protocol::PersistentProtocol;
pub use transport::{BoxedSocket, Socket, Transport};
pub use uri::{ResourceRoots, ResourceTransformer, UriComponents};
