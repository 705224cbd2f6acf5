use async_trait::async_trait;
use persona_cli::prompt::{
    BuildSettings, ExampleTurn, GenerationKind, HistoryEntry, InjectionPrompt, PromptBuilder,
    PromptError, PromptSource, REPLY_PRIME_TOKENS, Role, ToolInvocation,
};
use persona_cli::providers::ChatMessage;
use persona_cli::tokens::TokenCounter;

/// One token per content character: budget arithmetic in tests stays exact.
struct LenCounter;

#[async_trait]
impl TokenCounter for LenCounter {
    async fn count(&self, messages: &[ChatMessage]) -> Result<u32, PromptError> {
        Ok(messages
            .iter()
            .map(|m| {
                m.content
                    .as_ref()
                    .map(|b| b.joined_text().chars().count() as u32)
                    .unwrap_or(0)
            })
            .sum())
    }
}

/// Bare settings: empty markers, no squashing, whole context usable.
fn settings(context: u32) -> BuildSettings {
    BuildSettings {
        context_size: context,
        response_size: 0,
        squash_system: false,
        new_chat_prompt: String::new(),
        new_example_chat_prompt: String::new(),
        group_nudge: String::new(),
        ..Default::default()
    }
}

fn entry(role: Role, content: &str) -> HistoryEntry {
    HistoryEntry {
        role,
        content: content.into(),
        ..Default::default()
    }
}

fn texts(chat: &[ChatMessage]) -> Vec<String> {
    chat.iter().map(|m| m.text()).collect()
}

#[tokio::test]
async fn history_is_truncated_oldest_first_without_error() {
    // 5 messages of 30 tokens against a budget that fits exactly 3
    let source = PromptSource {
        history: (0..5)
            .map(|i| entry(Role::User, &format!("{i}").repeat(30)))
            .collect(),
        ..Default::default()
    };
    let builder = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + 100));
    let completion = builder.build(&source).await.unwrap();

    let chat = completion.chat();
    assert_eq!(chat.len(), 3);
    assert_eq!(
        texts(&chat),
        ["2".repeat(30), "3".repeat(30), "4".repeat(30)]
    );
    assert_eq!(completion.budget(), 10);
}

#[tokio::test]
async fn more_budget_never_includes_fewer_history_messages() {
    let history: Vec<HistoryEntry> = (0..6)
        .map(|i| entry(Role::User, &format!("{i}").repeat(25)))
        .collect();
    let mut last_len = 0;
    for budget in [0u32, 30, 60, 120, 200] {
        let source = PromptSource {
            history: history.clone(),
            ..Default::default()
        };
        let builder = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + budget));
        let chat = builder.build(&source).await.unwrap().chat();
        assert!(chat.len() >= last_len, "budget {budget} dropped messages");
        last_len = chat.len();
    }
    assert_eq!(last_len, 6);
}

#[tokio::test]
async fn mandatory_prompt_overflow_is_a_hard_error() {
    let source = PromptSource {
        system_prompt: Some("x".repeat(50)),
        ..Default::default()
    };
    let builder = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + 10));
    let err = builder.build(&source).await.unwrap_err();
    match err {
        PromptError::BudgetExceeded(id) => assert_eq!(id, "main"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn depth_zero_injection_lands_before_the_newest_message() {
    let source = PromptSource {
        history: vec![
            entry(Role::User, "one"),
            entry(Role::Assistant, "two"),
            entry(Role::User, "three"),
        ],
        injections: vec![InjectionPrompt {
            role: Role::System,
            content: "debug-note".into(),
            depth: 0,
            order: 100,
        }],
        ..Default::default()
    };
    let builder = PromptBuilder::new(&LenCounter, settings(10_000));
    let chat = builder.build(&source).await.unwrap().chat();
    assert_eq!(texts(&chat), ["one", "two", "debug-note", "three"]);
}

#[tokio::test]
async fn injections_group_by_depth_order_and_role() {
    let inject = |role, content: &str, depth, order| InjectionPrompt {
        role,
        content: content.into(),
        depth,
        order,
    };
    let source = PromptSource {
        history: vec![
            entry(Role::User, "one"),
            entry(Role::Assistant, "two"),
            entry(Role::User, "three"),
        ],
        injections: vec![
            inject(Role::System, "A", 1, 10),
            inject(Role::System, "B", 1, 20),
            inject(Role::User, "C", 0, 100),
            inject(Role::Assistant, "E", 0, 50),
            inject(Role::System, "D", 5, 100),
        ],
        ..Default::default()
    };
    let builder = PromptBuilder::new(&LenCounter, settings(10_000));
    let chat = builder.build(&source).await.unwrap().chat();
    // depth 5 clamps to the front; within depth 1 higher order comes first;
    // within depth 0 the role order is system, user, assistant
    assert_eq!(
        texts(&chat),
        ["D", "one", "B\nA", "two", "C", "E", "three"]
    );
    let roles: Vec<&str> = chat.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(
        roles,
        ["system", "user", "system", "assistant", "user", "assistant", "user"]
    );
}

#[tokio::test]
async fn control_prompts_survive_history_pressure() {
    // Budget: 20 for the quiet prompt + 60 for history -> two turns survive
    let mut s = settings(REPLY_PRIME_TOKENS + 80);
    s.kind = GenerationKind::Quiet;
    s.quiet_prompt = Some("q".repeat(20));
    let source = PromptSource {
        history: (0..5)
            .map(|i| entry(Role::User, &format!("{i}").repeat(30)))
            .collect(),
        ..Default::default()
    };
    let builder = PromptBuilder::new(&LenCounter, s);
    let chat = builder.build(&source).await.unwrap().chat();

    assert_eq!(
        texts(&chat),
        ["3".repeat(30), "4".repeat(30), "q".repeat(20)]
    );
}

#[tokio::test]
async fn pinned_examples_win_the_budget_race() {
    let example = vec![ExampleTurn {
        role: Role::User,
        name: None,
        content: "e".repeat(40),
    }];
    let history = vec![entry(Role::User, &"h".repeat(40))];

    // Only one of the two regions fits
    let mut pinned = settings(REPLY_PRIME_TOKENS + 40);
    pinned.pin_examples = true;
    let source = PromptSource {
        history: history.clone(),
        examples: vec![example.clone()],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, pinned)
        .build(&source)
        .await
        .unwrap()
        .chat();
    assert_eq!(texts(&chat), ["e".repeat(40)]);

    let chat = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + 40))
        .build(&source)
        .await
        .unwrap()
        .chat();
    assert_eq!(texts(&chat), ["h".repeat(40)]);
}

#[tokio::test]
async fn example_groups_are_atomic() {
    let group = |text: &str, turns: usize| -> Vec<ExampleTurn> {
        (0..turns)
            .map(|_| ExampleTurn {
                role: Role::User,
                name: None,
                content: text.repeat(10),
            })
            .collect()
    };
    // First group costs 20, second 40; budget 30 fits only the first whole
    let source = PromptSource {
        examples: vec![group("a", 2), group("b", 4)],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + 30))
        .build(&source)
        .await
        .unwrap()
        .chat();
    assert_eq!(chat.len(), 2);
    assert!(texts(&chat).iter().all(|t| t == &"a".repeat(10)));

    // An unaffordable first group stops population before the second
    let source = PromptSource {
        examples: vec![group("b", 4), group("a", 2)],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, settings(REPLY_PRIME_TOKENS + 30))
        .build(&source)
        .await
        .unwrap()
        .chat();
    assert!(chat.is_empty());
}

#[tokio::test]
async fn continuation_detaches_the_newest_message_from_history() {
    let mut s = settings(10_000);
    s.kind = GenerationKind::Continue;
    s.continue_prefill = Some("Continue: ".into());
    let source = PromptSource {
        history: vec![
            entry(Role::User, "hi"),
            entry(Role::Assistant, "there"),
        ],
        ..Default::default()
    };
    let completion = PromptBuilder::new(&LenCounter, s).build(&source).await.unwrap();
    let chat = completion.chat();
    assert_eq!(texts(&chat), ["hi", "Continue: there"]);

    // The detached turn lives in the control section and cannot be dropped
    let ids: Vec<&str> = completion
        .root()
        .flatten()
        .iter()
        .map(|m| m.identifier())
        .collect();
    assert!(ids.contains(&"continue_message"));
}

#[tokio::test]
async fn detached_continuation_is_immune_to_truncation() {
    let mut s = settings(REPLY_PRIME_TOKENS + 5);
    s.kind = GenerationKind::Continue;
    s.continue_prefill = Some(String::new());
    let source = PromptSource {
        history: vec![
            entry(Role::User, "a".repeat(50).as_str()),
            entry(Role::Assistant, "tail!"),
        ],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, s)
        .build(&source)
        .await
        .unwrap()
        .chat();
    // The older turn no longer fits; the continued turn always does
    assert_eq!(texts(&chat), ["tail!"]);
}

#[tokio::test]
async fn tool_calls_round_trip_through_the_wire_format() {
    let source = PromptSource {
        history: vec![
            entry(Role::User, "look this up"),
            HistoryEntry {
                role: Role::Assistant,
                tool_calls: vec![ToolInvocation {
                    id: "t1".into(),
                    name: "fn".into(),
                    parameters: "{}".into(),
                }],
                ..Default::default()
            },
            HistoryEntry {
                role: Role::Tool,
                content: "{\"answer\":42}".into(),
                tool_call_id: Some("t1".into()),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, settings(10_000))
        .build(&source)
        .await
        .unwrap()
        .chat();
    assert_eq!(chat.len(), 3);

    // Content-less assistant turn survives on tool calls alone, with no
    // content key on the wire
    let call = &chat[1];
    let json = serde_json::to_value(call).unwrap();
    assert!(json.get("content").is_none());
    assert_eq!(json["tool_calls"][0]["id"], "t1");
    assert_eq!(json["tool_calls"][0]["function"]["name"], "fn");

    // Tool result carries the call id it answers
    assert_eq!(chat[2].tool_call_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn fixed_sections_keep_priority_order() {
    let mut s = settings(10_000);
    s.squash_system = false;
    let source = PromptSource {
        system_prompt: Some("main prompt".into()),
        world_info_before: vec!["wi before".into()],
        world_info_after: vec!["wi after".into()],
        character: persona_cli::prompt::CharacterDefs {
            name: "Seraphina".into(),
            description: "desc".into(),
            personality: "pers".into(),
            scenario: "scen".into(),
            system_prompt_override: None,
        },
        persona: Some(persona_cli::prompt::PersonaDefs {
            name: "User".into(),
            description: "persona desc".into(),
        }),
        ordered_prompts: vec![persona_cli::prompt::OrderedPrompt {
            identifier: "style_guide".into(),
            role: Role::System,
            content: "short replies".into(),
            enabled: true,
        }],
        extension_prompts: vec![persona_cli::prompt::ExtensionPrompt {
            identifier: "author_note".into(),
            role: Role::System,
            content: "note".into(),
            offset: 1,
        }],
        history: vec![entry(Role::User, "hello")],
        ..Default::default()
    };
    let completion = PromptBuilder::new(&LenCounter, s).build(&source).await.unwrap();
    let ids: Vec<&str> = completion
        .root()
        .flatten()
        .iter()
        .map(|m| m.identifier())
        .collect();
    assert_eq!(
        ids,
        [
            "world_info_before",
            "main",
            "author_note",
            "world_info_after",
            "char_description",
            "char_personality",
            "scenario",
            "persona_description",
            "style_guide",
            "new_chat",
            "chat_history-0",
        ]
    );
}

#[tokio::test]
async fn character_override_replaces_the_main_prompt() {
    let source = PromptSource {
        system_prompt: Some("stock prompt".into()),
        character: persona_cli::prompt::CharacterDefs {
            name: "Seraphina".into(),
            system_prompt_override: Some("card prompt".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let completion = PromptBuilder::new(&LenCounter, settings(10_000))
        .build(&source)
        .await
        .unwrap();
    assert_eq!(texts(&completion.chat()), ["card prompt"]);
    assert_eq!(completion.overrides().to_vec(), vec!["main".to_string()]);
}

#[tokio::test]
async fn group_chats_get_a_trailing_nudge() {
    let mut s = settings(10_000);
    s.group_nudge = "[Reply as Seraphina.]".into();
    let source = PromptSource {
        history: vec![entry(Role::User, "hello")],
        group_members: vec!["Seraphina".into(), "Mira".into()],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, s).build(&source).await.unwrap().chat();
    assert_eq!(texts(&chat), ["hello", "[Reply as Seraphina.]"]);
}

#[tokio::test]
async fn squashing_merges_sections_but_not_markers() {
    let mut s = settings(10_000);
    s.squash_system = true;
    s.new_chat_prompt = "[Start a new chat]".into();
    let source = PromptSource {
        system_prompt: Some("one".into()),
        character: persona_cli::prompt::CharacterDefs {
            description: "two".into(),
            ..Default::default()
        },
        history: vec![entry(Role::User, "hello")],
        ..Default::default()
    };
    let chat = PromptBuilder::new(&LenCounter, s).build(&source).await.unwrap().chat();
    assert_eq!(texts(&chat), ["one\ntwo", "[Start a new chat]", "hello"]);
}

#[tokio::test]
async fn budget_accounts_for_everything_it_kept() {
    let source = PromptSource {
        system_prompt: Some("sys".repeat(4)),
        history: (0..3)
            .map(|i| entry(Role::User, &format!("{i}").repeat(10)))
            .collect(),
        ..Default::default()
    };
    let context = 500u32;
    let completion = PromptBuilder::new(&LenCounter, settings(context))
        .build(&source)
        .await
        .unwrap();
    // budget = context - reply priming - everything attached
    assert_eq!(
        completion.budget(),
        context as i64 - REPLY_PRIME_TOKENS as i64 - completion.root().tokens() as i64
    );
}
