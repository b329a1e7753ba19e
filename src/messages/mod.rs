pub mod export;
pub mod settings;
pub mod storage;
pub mod types;

pub use export::{export, Export, ExportFormat};
pub use settings::{SettingsStore, SettingsUpdate, UserSettings};
pub use storage::{derive_title, ConversationStore, MAX_TITLE_CHARS};
pub use types::{
    Attachment, Conversation, MediaKind, NewMessage, Role, StoredMessage, UserId, DEFAULT_TITLE,
};
