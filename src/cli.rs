use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "persona-cli", author, version, about = "Character chat with multiple LLM providers", long_about = None)]
pub struct Cli {
    /// Optional path to a config file (toml)
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Chat with a character
    Chat(ChatArgs),
    /// List models for a provider
    ListModels(ListModelsArgs),
    /// Show available providers
    Providers,
    /// Print the default config path
    ConfigPath,
    /// Create an example config file if missing
    InitConfig,
    /// Manage session history
    History(HistoryArgs),
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Provider key, e.g. openai, anthropic, ollama
    #[arg(short, long, default_value = "openai")]
    pub provider: String,

    /// Model name; if not given, provider default is used
    #[arg(short, long)]
    pub model: Option<String>,

    /// User message. Optional with --continue or --impersonate
    #[arg(long)]
    pub message: Option<String>,

    /// Path to a character card (JSON)
    #[arg(long)]
    pub character: Option<String>,

    /// Persona name to speak as (overrides the configured persona)
    #[arg(long)]
    pub persona: Option<String>,

    /// Optional session id to persist and load history
    #[arg(long)]
    pub session: Option<String>,

    /// Stream tokens as they arrive
    #[arg(long)]
    pub stream: bool,

    /// Temperature (0.0 - 2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Max output tokens; also reserved out of the context budget
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Context window size in tokens
    #[arg(long, value_name = "TOKENS", default_value_t = 16_000)]
    pub max_context: u32,

    /// Ask for the user's next line instead of the character's
    #[arg(long)]
    pub impersonate: bool,

    /// Continue the last message instead of answering
    #[arg(long = "continue")]
    pub continue_last: bool,

    /// One-shot instruction appended as the final prompt
    #[arg(long)]
    pub quiet: Option<String>,

    /// Author's note spliced near the main prompt
    #[arg(long)]
    pub author_note: Option<String>,

    /// Author's note offset relative to the main prompt
    #[arg(long, default_value_t = 1)]
    pub author_note_offset: i64,

    /// Group chat member names (adds a reply nudge)
    #[arg(long = "group-member", num_args = 1.., value_delimiter = ' ')]
    pub group_members: Vec<String>,

    /// Give dialogue examples budget priority over chat history
    #[arg(long)]
    pub pin_examples: bool,

    /// Keep consecutive system messages separate
    #[arg(long)]
    pub no_squash: bool,

    /// Attach one or more images to the message (url or data uri)
    #[arg(long = "image", num_args = 1.., value_delimiter = ' ')]
    pub images: Vec<String>,

    /// Log budget decisions while the prompt is assembled
    #[arg(long)]
    pub trace_prompt: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum HistoryAction {
    List,
    Show,
    Clear,
    ClearAll,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Action to perform: list | show | clear | clear-all
    #[arg(value_enum)]
    pub action: HistoryAction,

    /// Session id (for show/clear)
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListModelsArgs {
    /// Provider key, e.g. openai, anthropic, ollama
    #[arg(short, long, default_value = "openai")]
    pub provider: String,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
