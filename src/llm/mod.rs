pub mod client;
pub mod config;
pub mod context;
pub mod prompts;

pub use client::{ChatOptions, Completion, FragmentStream, LLMClient, ModelInfo};
pub use config::{LLMConfig, ThinkingMode};
pub use context::{text_chars, ContentPart, ConversationContext, PartKind};
pub use prompts::build_system_prompt;
