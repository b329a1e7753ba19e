pub mod events;
pub mod references;
pub mod service;
pub mod session;
pub mod sink;

pub use events::ChatEvent;
pub use references::voice_reference;
pub use service::{ChatReply, ChatRequest, ChatService, PreparedTurn};
pub use session::{ChatTurn, TurnOutcome};
pub use sink::{
    BufferedSink, ChannelSink, EventReceiver, EventSink, PersistReceipt, TurnRecorder, Undelivered,
};
