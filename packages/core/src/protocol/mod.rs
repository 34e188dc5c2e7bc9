// Протокол: типы сообщений, wire format, валидация, внешние порты

#[cfg(any(test, feature = "test"))]
pub mod memory;
pub mod messages;
pub mod transport;
pub mod validation;
pub mod wire;

pub use messages::{
    Attachment, Content, DataMessage, Envelope, EnvelopeType, MessageId, PreKeySignalMessage,
    PreKeyUpload, ReactionMessage, ReceiptKind, ReceiptMessage, SignalMessage, SignedPreKeyPublic,
};
pub use transport::{KeyDirectory, Transport};

#[cfg(any(test, feature = "test"))]
pub use memory::{ChannelTransport, MemoryDirectory};
