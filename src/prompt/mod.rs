pub mod collection;
pub mod completion;
pub mod message;
pub mod populate;

pub use collection::{ChatItem, MessageCollection};
pub use completion::{ChatCompletion, InsertAt};
pub use message::{ImageQuality, Message, Role, ToolInvocation};
pub use populate::{
    BuildSettings, CharacterDefs, ExampleTurn, ExtensionPrompt, GenerationKind, HistoryEntry,
    InjectionPrompt, OrderedPrompt, PersonaDefs, PromptBuilder, PromptSource,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PromptError {
    /// A mandatory item would push the budget negative. Carries the
    /// identifier of the offending item so callers can report it.
    #[error("token budget exceeded by '{0}'")]
    BudgetExceeded(String),
    /// A named collection was referenced but never added. A configuration
    /// or programming defect, not a user-recoverable condition.
    #[error("unknown collection: {0}")]
    IdentifierNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("token counter: {0}")]
    Counter(String),
}

/// Identifier of the synthetic marker opening the real chat history.
pub const NEW_CHAT_ID: &str = "new_chat";
/// Identifier of the synthetic marker opening each dialogue-example group.
pub const NEW_EXAMPLE_CHAT_ID: &str = "new_example_chat";
/// Identifier of the trailing group-chat nudge.
pub const GROUP_NUDGE_ID: &str = "group_nudge";

pub const CHAT_HISTORY_ID: &str = "chat_history";
pub const DIALOGUE_EXAMPLES_ID: &str = "dialogue_examples";
pub const CONTROL_PROMPTS_ID: &str = "control_prompts";
pub const MAIN_PROMPT_ID: &str = "main";

/// Fixed allowance for reply priming overhead, reserved before anything else.
pub const REPLY_PRIME_TOKENS: u32 = 3;
