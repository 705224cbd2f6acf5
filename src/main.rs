use anyhow::Result;
use colored::*;
use futures_util::StreamExt;
use persona_cli::cards::CharacterCard;
use persona_cli::cli::{ChatArgs, Cli, Commands, HistoryAction};
use persona_cli::config::{self, Config, PromptsConfig};
use persona_cli::media::HttpMediaFetcher;
use persona_cli::prompt::populate::{
    DEFAULT_CONTINUE_NUDGE, DEFAULT_GROUP_NUDGE, DEFAULT_IMPERSONATION_PROMPT,
    DEFAULT_NEW_CHAT_PROMPT, DEFAULT_NEW_EXAMPLE_CHAT_PROMPT,
};
use persona_cli::prompt::{
    BuildSettings, CharacterDefs, ExampleTurn, ExtensionPrompt, GenerationKind, HistoryEntry,
    ImageQuality, InjectionPrompt, OrderedPrompt, PersonaDefs, PromptBuilder, PromptError,
    PromptSource, Role, ToolInvocation,
};
use persona_cli::providers::{ChatMessage, ChatRequest, registry::ProviderRegistry};
use persona_cli::session::SessionStore;
use persona_cli::templating::render_or_raw;
use persona_cli::tokens::HeuristicCounter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    let registry = ProviderRegistry::from_config(&cfg)?;

    match cli.command {
        Commands::Chat(cmd) => run_chat(cmd, &cfg, &registry).await?,
        Commands::History(h) => match h.action {
            HistoryAction::List => {
                let sessions = SessionStore::list().unwrap_or_default();
                for s in sessions {
                    println!("{}", s);
                }
            }
            HistoryAction::Show => {
                let id = h.session.as_deref().unwrap_or("");
                if id.is_empty() {
                    eprintln!("--session is required for show");
                } else {
                    let msgs = SessionStore::load(id).unwrap_or_default();
                    for m in msgs {
                        println!("{}: {}", m.role, m.text());
                    }
                }
            }
            HistoryAction::Clear => {
                let id = h.session.as_deref().unwrap_or("");
                if id.is_empty() {
                    eprintln!("--session is required for clear");
                } else {
                    let _ = SessionStore::delete(id);
                    println!("cleared {}", id);
                }
            }
            HistoryAction::ClearAll => {
                let _ = SessionStore::clear_all();
                println!("cleared all sessions");
            }
        },
        Commands::ListModels(cmd) => {
            let provider = registry.get(&cmd.provider)?;
            let models = provider.list_models().await?;
            for m in models {
                println!("{}", m);
            }
        }
        Commands::Providers => {
            println!("{}", "Available providers:".bold());
            for key in registry.list() {
                match registry.get(&key) {
                    Ok(p) => println!("- {} ({})", key, p.name()),
                    Err(_) => println!("- {}", key),
                }
            }
        }
        Commands::ConfigPath => {
            println!("{}", Config::default_path()?.display());
        }
        Commands::InitConfig => {
            let path = Config::write_example_if_absent()?;
            println!("Wrote example config to {}", path.display());
        }
    }

    Ok(())
}

async fn run_chat(cmd: ChatArgs, cfg: &Config, registry: &ProviderRegistry) -> Result<()> {
    let provider = registry.get(&cmd.provider)?;

    let card = match &cmd.character {
        Some(path) => CharacterCard::load(path)?,
        None => CharacterCard::default(),
    };
    let char_name = if card.name.is_empty() {
        "Assistant".to_string()
    } else {
        card.name.clone()
    };
    let persona_cfg = cfg.persona.clone().unwrap_or_default();
    let user_name = cmd
        .persona
        .clone()
        .or(persona_cfg.name.clone())
        .unwrap_or_else(|| "User".into());
    let render = |text: &str| render_or_raw(text, &char_name, &user_name);

    let kind = if cmd.impersonate {
        GenerationKind::Impersonate
    } else if cmd.continue_last {
        GenerationKind::Continue
    } else if cmd.quiet.is_some() {
        GenerationKind::Quiet
    } else {
        GenerationKind::Normal
    };

    // Session history plus the fresh user message form the droppable region
    let mut history: Vec<HistoryEntry> = Vec::new();
    if let Some(session_id) = &cmd.session {
        for m in SessionStore::load(session_id).unwrap_or_default() {
            history.push(history_entry(m));
        }
    }
    let user_text = cmd.message.as_deref().unwrap_or("").trim().to_string();
    if !user_text.is_empty() {
        history.push(HistoryEntry {
            role: Role::User,
            name: (!cmd.group_members.is_empty()).then(|| user_name.clone()),
            content: render(&user_text),
            images: cmd.images.clone(),
            ..Default::default()
        });
    } else if matches!(kind, GenerationKind::Normal) {
        anyhow::bail!("a message is required (use --message, --continue, or --impersonate)");
    }

    let prompts = cfg.prompts.clone().unwrap_or_default();
    let source = build_source(&cmd, &card, &prompts, &persona_cfg, &user_name, history, &render)?;
    let settings = build_settings(&cmd, &prompts, kind, &render)?;

    let counter = HeuristicCounter;
    let fetcher = HttpMediaFetcher::new();
    let builder = PromptBuilder::new(&counter, settings).with_fetcher(&fetcher);
    let completion = match builder.build(&source).await {
        Ok(c) => c,
        Err(PromptError::BudgetExceeded(id)) => anyhow::bail!(
            "prompt '{}' does not fit the context budget; raise --max-context or disable custom prompts",
            id
        ),
        Err(e) => return Err(e.into()),
    };
    let messages = completion.chat();
    eprintln!(
        "[prompt] {} messages, ~{} tokens ({} of budget left)",
        messages.len(),
        completion.root().tokens(),
        completion.budget()
    );

    let request = ChatRequest {
        model: cmd
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string()),
        messages,
        stream: cmd.stream,
        temperature: cmd.temperature,
        max_tokens: cmd.max_tokens,
    };

    if cmd.stream {
        let mut stream = provider.chat_stream(request).await?;
        let mut acc = String::new();
        let abort = tokio::signal::ctrl_c();
        tokio::pin!(abort);
        loop {
            tokio::select! {
                _ = &mut abort => {
                    // Cooperative cancel: stop pulling chunks, keep the partial reply
                    eprintln!();
                    eprintln!("[stream] aborted, keeping partial reply");
                    break;
                }
                chunk = stream.next() => {
                    match chunk.transpose()? {
                        Some(c) => {
                            if let Some(content) = c.delta {
                                print!("{}", content);
                                acc.push_str(&content);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        println!();
        persist(&cmd, &user_text, &acc)?;
    } else {
        // Non-stream with fallback
        let mut resp = provider.chat(request.clone()).await;
        if resp.is_err()
            && let Some(fb) = cfg.fallback.as_ref().and_then(|f| f.providers.clone())
        {
            eprintln!(
                "[fallback] primary '{}' failed, trying chain: {}",
                cmd.provider,
                fb.join(", ")
            );
            for alt in &fb {
                if alt == &cmd.provider {
                    continue;
                }
                if let Ok(p) = registry.get(alt) {
                    resp = p.chat(request.clone()).await;
                    if resp.is_ok() {
                        eprintln!("[fallback] succeeded with '{}'", alt);
                        break;
                    }
                }
            }
        }
        let resp = resp?;
        let content = resp.content.clone().unwrap_or_default();
        if !content.is_empty() {
            println!("{}", content);
        }
        if let Some(ref usage) = resp.usage {
            eprintln!(
                "[usage] in={} out={} total={}",
                usage.input_tokens, usage.output_tokens, usage.total_tokens
            );
        }
        persist(&cmd, &user_text, &content)?;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_source(
    cmd: &ChatArgs,
    card: &CharacterCard,
    prompts: &PromptsConfig,
    persona_cfg: &config::PersonaConfig,
    user_name: &str,
    history: Vec<HistoryEntry>,
    render: &dyn Fn(&str) -> String,
) -> Result<PromptSource> {
    let ordered_prompts = prompts
        .ordered
        .iter()
        .flatten()
        .map(|p| {
            Ok(OrderedPrompt {
                identifier: p.identifier.clone(),
                role: parse_role(p.role.as_deref())?,
                content: render(&p.content),
                enabled: p.enabled.unwrap_or(true),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let injections = prompts
        .inject
        .iter()
        .flatten()
        .map(|p| {
            Ok(InjectionPrompt {
                role: parse_role(p.role.as_deref())?,
                content: render(&p.content),
                depth: p.depth.unwrap_or(0),
                order: p.order.unwrap_or(100),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let extension_prompts = cmd
        .author_note
        .iter()
        .map(|note| ExtensionPrompt {
            identifier: "author_note".into(),
            role: Role::System,
            content: render(note),
            offset: cmd.author_note_offset,
        })
        .collect();

    let examples = card
        .examples
        .iter()
        .map(|group| {
            group
                .iter()
                .map(|turn| ExampleTurn {
                    role: Role::parse_or_default(turn.role.as_deref()),
                    name: turn.name.clone(),
                    content: render(&turn.content),
                })
                .collect()
        })
        .collect();

    Ok(PromptSource {
        character: CharacterDefs {
            name: card.name.clone(),
            description: render(&card.description),
            personality: render(&card.personality),
            scenario: render(&card.scenario),
            system_prompt_override: (!card.system_prompt.is_empty())
                .then(|| render(&card.system_prompt)),
        },
        persona: Some(PersonaDefs {
            name: user_name.to_string(),
            description: render(persona_cfg.description.as_deref().unwrap_or("")),
        }),
        system_prompt: prompts.system_prompt.as_deref().map(render),
        world_info_before: card.world_info.before.iter().map(|s| render(s)).collect(),
        world_info_after: card.world_info.after.iter().map(|s| render(s)).collect(),
        ordered_prompts,
        extension_prompts,
        injections,
        history,
        examples,
        group_members: cmd.group_members.clone(),
    })
}

fn build_settings(
    cmd: &ChatArgs,
    prompts: &PromptsConfig,
    kind: GenerationKind,
    render: &dyn Fn(&str) -> String,
) -> Result<BuildSettings> {
    let image_quality = match prompts.image_quality.as_deref() {
        Some(q) => ImageQuality::try_parse(q)?,
        None => ImageQuality::Auto,
    };
    Ok(BuildSettings {
        context_size: cmd.max_context,
        response_size: cmd.max_tokens.unwrap_or(1024),
        kind,
        pin_examples: cmd.pin_examples || prompts.pin_examples.unwrap_or(false),
        squash_system: !cmd.no_squash && prompts.squash_system_messages.unwrap_or(true),
        injection_separator: prompts.injection_separator.clone().unwrap_or_else(|| "\n".into()),
        image_quality,
        impersonation_prompt: render(
            prompts
                .impersonation_prompt
                .as_deref()
                .unwrap_or(DEFAULT_IMPERSONATION_PROMPT),
        ),
        continue_nudge: render(
            prompts.continue_nudge.as_deref().unwrap_or(DEFAULT_CONTINUE_NUDGE),
        ),
        continue_prefill: prompts.continue_prefill.clone(),
        quiet_prompt: cmd.quiet.as_deref().map(render),
        new_chat_prompt: render(
            prompts.new_chat_prompt.as_deref().unwrap_or(DEFAULT_NEW_CHAT_PROMPT),
        ),
        new_example_chat_prompt: render(
            prompts
                .new_example_chat_prompt
                .as_deref()
                .unwrap_or(DEFAULT_NEW_EXAMPLE_CHAT_PROMPT),
        ),
        group_nudge: render(prompts.group_nudge.as_deref().unwrap_or(DEFAULT_GROUP_NUDGE)),
        trace: cmd.trace_prompt,
    })
}

fn parse_role(role: Option<&str>) -> Result<Role> {
    match role {
        None => Ok(Role::System),
        Some(r) => Role::try_parse(r).map_err(Into::into),
    }
}

/// Replays a persisted wire message into a population-ready history entry.
fn history_entry(m: ChatMessage) -> HistoryEntry {
    let images: Vec<String> = m
        .content
        .as_ref()
        .map(|b| b.image_urls().into_iter().map(str::to_string).collect())
        .unwrap_or_default();
    let tool_calls: Vec<ToolInvocation> = m
        .tool_calls
        .iter()
        .flatten()
        .map(|c| ToolInvocation {
            id: c.id.clone(),
            name: c.function.name.clone(),
            parameters: c.function.arguments.clone(),
        })
        .collect();
    HistoryEntry {
        role: Role::parse_or_default(Some(&m.role)),
        name: m.name.clone(),
        content: m.text(),
        images,
        video: None,
        tool_calls,
        tool_call_id: m.tool_call_id.clone(),
        identifier: None,
    }
}

fn persist(cmd: &ChatArgs, user_text: &str, assistant: &str) -> Result<()> {
    let Some(session_id) = &cmd.session else {
        return Ok(());
    };
    let mut turns: Vec<ChatMessage> = Vec::new();
    if !user_text.is_empty() {
        turns.push(ChatMessage::user(user_text));
    }
    if !assistant.is_empty() {
        turns.push(ChatMessage::assistant(assistant));
    }
    if !turns.is_empty() {
        SessionStore::append(session_id, &turns)?;
    }
    Ok(())
}
