pub mod chat_completion;
pub mod completions;
pub mod embeddings;

pub use chat_completion::{
    CreateChatCompletionPayload, Message, MessageContent, Stop, ToolChoice, ToolChoiceDefaults,
    ToolDefinition,
};
pub use completions::{CompletionPrompt, CreateCompletionPayload};
pub use embeddings::{CreateEmbeddingPayload, CreateEmbeddingResponse, EmbeddingInput};
