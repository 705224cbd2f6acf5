use std::collections::BTreeMap;

use log::debug;

use super::collection::MessageCollection;
use super::completion::ChatCompletion;
use super::message::{ImageQuality, Message, Role, ToolInvocation};
use super::{
    CHAT_HISTORY_ID, CONTROL_PROMPTS_ID, DIALOGUE_EXAMPLES_ID, GROUP_NUDGE_ID, MAIN_PROMPT_ID,
    NEW_CHAT_ID, NEW_EXAMPLE_CHAT_ID, PromptError, REPLY_PRIME_TOKENS,
};
use crate::media::MediaFetcher;
use crate::tokens::TokenCounter;

pub const DEFAULT_NEW_CHAT_PROMPT: &str = "[Start a new chat]";
pub const DEFAULT_NEW_EXAMPLE_CHAT_PROMPT: &str = "[Example dialogue]";
pub const DEFAULT_IMPERSONATION_PROMPT: &str =
    "[Write your next reply from the point of view of {user}. Do not write as {char}.]";
pub const DEFAULT_CONTINUE_NUDGE: &str =
    "[Continue your last message without repeating its original content.]";
pub const DEFAULT_GROUP_NUDGE: &str = "[Write the next reply only as {char}.]";

/// What the assembled prompt is for. Selects which control prompts land at
/// the very end of the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationKind {
    #[default]
    Normal,
    Impersonate,
    Quiet,
    Continue,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub context_size: u32,
    pub response_size: u32,
    pub kind: GenerationKind,
    /// Give dialogue examples budget priority over chat history.
    pub pin_examples: bool,
    pub squash_system: bool,
    pub injection_separator: String,
    pub image_quality: ImageQuality,
    pub impersonation_prompt: String,
    pub continue_nudge: String,
    /// When set, continuation detaches the newest history message into the
    /// control section, prefixed with this string.
    pub continue_prefill: Option<String>,
    pub quiet_prompt: Option<String>,
    pub new_chat_prompt: String,
    pub new_example_chat_prompt: String,
    pub group_nudge: String,
    pub trace: bool,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            context_size: 16_000,
            response_size: 1024,
            kind: GenerationKind::Normal,
            pin_examples: false,
            squash_system: false,
            injection_separator: "\n".into(),
            image_quality: ImageQuality::Auto,
            impersonation_prompt: DEFAULT_IMPERSONATION_PROMPT.into(),
            continue_nudge: DEFAULT_CONTINUE_NUDGE.into(),
            continue_prefill: None,
            quiet_prompt: None,
            new_chat_prompt: DEFAULT_NEW_CHAT_PROMPT.into(),
            new_example_chat_prompt: DEFAULT_NEW_EXAMPLE_CHAT_PROMPT.into(),
            group_nudge: DEFAULT_GROUP_NUDGE.into(),
            trace: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CharacterDefs {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub scenario: String,
    /// Character-supplied replacement for the stock main prompt.
    pub system_prompt_override: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PersonaDefs {
    pub name: String,
    pub description: String,
}

/// A user-configured prompt added in user order after the fixed sections.
#[derive(Debug, Clone)]
pub struct OrderedPrompt {
    pub identifier: String,
    pub role: Role,
    pub content: String,
    pub enabled: bool,
}

/// Extension content (author's note, summary, retrieval results) spliced a
/// relative offset away from the main prompt.
#[derive(Debug, Clone)]
pub struct ExtensionPrompt {
    pub identifier: String,
    pub role: Role,
    pub content: String,
    pub offset: i64,
}

/// An out-of-band fragment merged into chat history `depth` messages from
/// the end.
#[derive(Debug, Clone)]
pub struct InjectionPrompt {
    pub role: Role,
    pub content: String,
    pub depth: usize,
    pub order: i32,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryEntry {
    pub role: Role,
    pub name: Option<String>,
    pub content: String,
    pub images: Vec<String>,
    pub video: Option<String>,
    pub tool_calls: Vec<ToolInvocation>,
    /// For tool-role entries: the id of the call being answered.
    pub tool_call_id: Option<String>,
    /// Overrides the index-derived identifier (used by injected fragments).
    pub identifier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExampleTurn {
    pub role: Role,
    pub name: Option<String>,
    pub content: String,
}

/// Everything the pipeline reads. Passed in explicitly; there is no global
/// settings object.
#[derive(Debug, Clone, Default)]
pub struct PromptSource {
    pub character: CharacterDefs,
    pub persona: Option<PersonaDefs>,
    pub system_prompt: Option<String>,
    pub world_info_before: Vec<String>,
    pub world_info_after: Vec<String>,
    pub ordered_prompts: Vec<OrderedPrompt>,
    pub extension_prompts: Vec<ExtensionPrompt>,
    pub injections: Vec<InjectionPrompt>,
    pub history: Vec<HistoryEntry>,
    pub examples: Vec<Vec<ExampleTurn>>,
    pub group_members: Vec<String>,
}

/// Runs the population pipeline: fixed sections first, droppable content
/// last, control prompts reserved up front and attached at the very end.
///
/// Only history, examples and in-history injections are ever silently
/// truncated; an unaffordable fixed section aborts the build with
/// `BudgetExceeded`.
pub struct PromptBuilder<'a> {
    counter: &'a dyn TokenCounter,
    fetcher: Option<&'a dyn MediaFetcher>,
    settings: BuildSettings,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(counter: &'a dyn TokenCounter, settings: BuildSettings) -> Self {
        Self {
            counter,
            fetcher: None,
            settings,
        }
    }

    pub fn with_fetcher(mut self, fetcher: &'a dyn MediaFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub async fn build(&self, source: &PromptSource) -> Result<ChatCompletion, PromptError> {
        let s = &self.settings;
        let mut chat = ChatCompletion::with_budget(s.context_size, s.response_size);
        chat.set_trace(s.trace);
        chat.reserve(REPLY_PRIME_TOKENS);

        self.populate_sections(&mut chat, source).await?;
        self.populate_ordered(&mut chat, source).await?;
        self.populate_extensions(&mut chat, source).await?;

        // Control prompts must survive however tight the budget gets, so
        // their cost is held back before any droppable content is placed.
        let (control, history) = self.control_prompts(source).await?;
        let control_tokens: u32 = control.iter().map(Message::tokens).sum();
        chat.reserve(control_tokens);

        chat.add(MessageCollection::new(DIALOGUE_EXAMPLES_ID), None)?;
        chat.add(MessageCollection::new(CHAT_HISTORY_ID), None)?;

        let history = self.merge_injections(history, &source.injections);
        let group = !source.group_members.is_empty();
        if s.pin_examples {
            self.populate_examples(&mut chat, source).await?;
            self.populate_history(&mut chat, history, group).await?;
        } else {
            self.populate_history(&mut chat, history, group).await?;
            self.populate_examples(&mut chat, source).await?;
        }

        chat.free(control_tokens);
        let mut controls = MessageCollection::new(CONTROL_PROMPTS_ID);
        for msg in control {
            controls.push(msg);
        }
        chat.add(controls, None)?;

        if s.squash_system {
            chat.squash_system_messages(self.counter).await?;
        }
        Ok(chat)
    }

    /// Fixed sections in priority order. The main prompt is always present,
    /// even when empty, so offset-anchored content has something to anchor
    /// to; empty messages vanish at emission.
    async fn populate_sections(
        &self,
        chat: &mut ChatCompletion,
        source: &PromptSource,
    ) -> Result<(), PromptError> {
        self.add_section(chat, "world_info_before", &source.world_info_before.join("\n"))
            .await?;

        let (main_text, overridden) = match &source.character.system_prompt_override {
            Some(text) if !text.is_empty() => (text.clone(), true),
            _ => (source.system_prompt.clone().unwrap_or_default(), false),
        };
        let main = Message::new(Role::System, main_text, MAIN_PROMPT_ID, self.counter).await?;
        chat.add(main, None)?;
        if overridden {
            chat.note_override(MAIN_PROMPT_ID);
        }

        self.add_section(chat, "world_info_after", &source.world_info_after.join("\n"))
            .await?;
        self.add_section(chat, "char_description", &source.character.description)
            .await?;
        self.add_section(chat, "char_personality", &source.character.personality)
            .await?;
        self.add_section(chat, "scenario", &source.character.scenario).await?;
        if let Some(persona) = &source.persona {
            self.add_section(chat, "persona_description", &persona.description)
                .await?;
        }
        Ok(())
    }

    async fn add_section(
        &self,
        chat: &mut ChatCompletion,
        identifier: &str,
        text: &str,
    ) -> Result<(), PromptError> {
        if text.is_empty() {
            return Ok(());
        }
        let msg = Message::new(Role::System, text, identifier, self.counter).await?;
        chat.add(msg, None)
    }

    async fn populate_ordered(
        &self,
        chat: &mut ChatCompletion,
        source: &PromptSource,
    ) -> Result<(), PromptError> {
        for prompt in &source.ordered_prompts {
            if !prompt.enabled || prompt.content.is_empty() {
                continue;
            }
            let msg =
                Message::new(prompt.role, &prompt.content, &prompt.identifier, self.counter)
                    .await?;
            chat.add(msg, None)?;
        }
        Ok(())
    }

    async fn populate_extensions(
        &self,
        chat: &mut ChatCompletion,
        source: &PromptSource,
    ) -> Result<(), PromptError> {
        for prompt in &source.extension_prompts {
            if prompt.content.is_empty() {
                continue;
            }
            let msg =
                Message::new(prompt.role, &prompt.content, &prompt.identifier, self.counter)
                    .await?;
            chat.splice(msg, MAIN_PROMPT_ID, prompt.offset)?;
        }
        Ok(())
    }

    /// Builds the always-kept control prompts for this generation kind.
    /// Prefix continuation detaches the newest history message here so the
    /// history budget loop can never drop it.
    async fn control_prompts(
        &self,
        source: &PromptSource,
    ) -> Result<(Vec<Message>, Vec<HistoryEntry>), PromptError> {
        let s = &self.settings;
        let mut history = source.history.clone();
        let mut control = Vec::new();
        match s.kind {
            GenerationKind::Normal => {}
            GenerationKind::Impersonate => {
                if !s.impersonation_prompt.is_empty() {
                    control.push(
                        Message::new(
                            Role::System,
                            &s.impersonation_prompt,
                            "impersonate",
                            self.counter,
                        )
                        .await?,
                    );
                }
            }
            GenerationKind::Quiet => {
                if let Some(quiet) = &s.quiet_prompt
                    && !quiet.is_empty()
                {
                    control.push(
                        Message::new(Role::System, quiet, "quiet_prompt", self.counter).await?,
                    );
                }
            }
            GenerationKind::Continue => {
                if let Some(prefill) = &s.continue_prefill {
                    if let Some(last) = history.pop() {
                        let content = format!("{prefill}{}", last.content);
                        let mut msg =
                            Message::new(last.role, content, "continue_message", self.counter)
                                .await?;
                        if let Some(name) = &last.name {
                            msg.set_name(name, self.counter).await?;
                        }
                        control.push(msg);
                    }
                } else if !s.continue_nudge.is_empty() {
                    control.push(
                        Message::new(Role::System, &s.continue_nudge, "continue_nudge", self.counter)
                            .await?,
                    );
                }
            }
        }
        Ok((control, history))
    }

    /// Splices depth-tagged injections into chronological history. Each
    /// depth contributes at most one message per role, built from its
    /// fragments in priority order and joined by the separator.
    fn merge_injections(
        &self,
        history: Vec<HistoryEntry>,
        injections: &[InjectionPrompt],
    ) -> Vec<HistoryEntry> {
        if injections.is_empty() {
            return history;
        }
        let mut by_depth: BTreeMap<usize, Vec<HistoryEntry>> = BTreeMap::new();
        for depth in injections.iter().map(|i| i.depth) {
            if by_depth.contains_key(&depth) {
                continue;
            }
            let mut group: Vec<&InjectionPrompt> =
                injections.iter().filter(|i| i.depth == depth).collect();
            group.sort_by(|a, b| b.order.cmp(&a.order));
            let mut entries = Vec::new();
            for role in [Role::System, Role::User, Role::Assistant] {
                let joined = group
                    .iter()
                    .filter(|i| i.role == role && !i.content.is_empty())
                    .map(|i| i.content.as_str())
                    .collect::<Vec<_>>()
                    .join(&self.settings.injection_separator);
                if joined.is_empty() {
                    continue;
                }
                entries.push(HistoryEntry {
                    role,
                    content: joined,
                    identifier: Some(format!("injection-{depth}-{role}")),
                    ..Default::default()
                });
            }
            by_depth.insert(depth, entries);
        }

        // Gap-indexed rebuild: no running insertion offsets to get wrong.
        // Deeper injections land earlier in the transcript; depths past the
        // start all pile up before the oldest message.
        let len = history.len();
        let mut gaps: Vec<Vec<HistoryEntry>> = vec![Vec::new(); len + 1];
        for (depth, entries) in by_depth.into_iter().rev() {
            gaps[injection_gap(len, depth)].extend(entries);
        }
        let mut out = Vec::with_capacity(len + injections.len());
        for (index, entry) in history.into_iter().enumerate() {
            out.append(&mut gaps[index]);
            out.push(entry);
        }
        out.append(&mut gaps[len]);
        out
    }

    /// Newest-to-oldest budget loop. Stops at the first message that does
    /// not fit; everything older is silently dropped. The new-chat marker
    /// (and group nudge) are priced before the loop so they always fit.
    async fn populate_history(
        &self,
        chat: &mut ChatCompletion,
        entries: Vec<HistoryEntry>,
        group: bool,
    ) -> Result<(), PromptError> {
        let s = &self.settings;
        let marker =
            Message::new(Role::System, &s.new_chat_prompt, NEW_CHAT_ID, self.counter).await?;
        let nudge = if group && !s.group_nudge.is_empty() {
            Some(Message::new(Role::System, &s.group_nudge, GROUP_NUDGE_ID, self.counter).await?)
        } else {
            None
        };
        let reserved = marker.tokens() + nudge.as_ref().map_or(0, Message::tokens);
        chat.reserve(reserved);

        let total = entries.len();
        let mut included = 0usize;
        for (index, entry) in entries.iter().enumerate().rev() {
            let msg = self.history_message(entry, index).await?;
            if !chat.can_afford(&msg) {
                debug!("chat history truncated to {included} of {total} messages");
                break;
            }
            chat.insert_at_start(msg, CHAT_HISTORY_ID)?;
            included += 1;
        }

        chat.free(reserved);
        chat.insert_at_start(marker, CHAT_HISTORY_ID)?;
        if let Some(nudge) = nudge {
            chat.insert_at_end(nudge, CHAT_HISTORY_ID)?;
        }
        Ok(())
    }

    async fn history_message(
        &self,
        entry: &HistoryEntry,
        index: usize,
    ) -> Result<Message, PromptError> {
        let identifier = entry
            .identifier
            .clone()
            .or_else(|| (entry.role == Role::Tool).then(|| entry.tool_call_id.clone()).flatten())
            .unwrap_or_else(|| format!("{CHAT_HISTORY_ID}-{index}"));
        let mut msg = Message::new(entry.role, &entry.content, identifier, self.counter).await?;
        if let Some(name) = &entry.name {
            msg.set_name(name, self.counter).await?;
        }
        if !entry.tool_calls.is_empty() {
            msg.set_tool_calls(entry.tool_calls.clone(), self.counter).await?;
        }
        if let Some(fetcher) = self.fetcher {
            for url in &entry.images {
                msg.add_image(url, self.settings.image_quality, fetcher).await;
            }
            if let Some(video) = &entry.video {
                msg.add_video(video, fetcher).await;
            }
        }
        Ok(msg)
    }

    /// Dialogue examples are all-or-nothing per group: the marker plus every
    /// turn must fit together, and population stops at the first group that
    /// does not.
    async fn populate_examples(
        &self,
        chat: &mut ChatCompletion,
        source: &PromptSource,
    ) -> Result<(), PromptError> {
        let total = source.examples.len();
        for (group_index, group) in source.examples.iter().enumerate() {
            let mut items = vec![
                Message::new(
                    Role::System,
                    &self.settings.new_example_chat_prompt,
                    NEW_EXAMPLE_CHAT_ID,
                    self.counter,
                )
                .await?,
            ];
            for (turn_index, turn) in group.iter().enumerate() {
                if turn.content.is_empty() {
                    continue;
                }
                let mut msg = Message::new(
                    turn.role,
                    &turn.content,
                    format!("{DIALOGUE_EXAMPLES_ID}-{group_index}-{turn_index}"),
                    self.counter,
                )
                .await?;
                if let Some(name) = &turn.name {
                    msg.set_name(name, self.counter).await?;
                }
                items.push(msg);
            }
            if !chat.can_afford_all(&items) {
                debug!("dialogue examples truncated to {group_index} of {total} groups");
                break;
            }
            for msg in items {
                chat.insert_at_end(msg, DIALOGUE_EXAMPLES_ID)?;
            }
        }
        Ok(())
    }
}

/// Which gap in chronological history an injection depth maps to: depth 0
/// sits immediately before the newest message, depths past the start clamp
/// to the front.
fn injection_gap(len: usize, depth: usize) -> usize {
    len.saturating_sub(depth + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_zero_sits_before_the_newest_message() {
        assert_eq!(injection_gap(3, 0), 2);
    }

    #[test]
    fn deep_injections_clamp_to_the_front() {
        assert_eq!(injection_gap(3, 2), 0);
        assert_eq!(injection_gap(3, 7), 0);
        assert_eq!(injection_gap(0, 0), 0);
    }
}
