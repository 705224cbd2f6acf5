use log::debug;

use super::collection::{ChatItem, MessageCollection};
use super::message::{Message, Role};
use super::{GROUP_NUDGE_ID, NEW_CHAT_ID, NEW_EXAMPLE_CHAT_ID, PromptError};
use crate::providers::{ChatMessage, MessageBody};
use crate::tokens::TokenCounter;

const ROOT_ID: &str = "root";

/// Marker identifiers that never take part in system-message squashing.
const SQUASH_EXCLUDED: [&str; 3] = [NEW_CHAT_ID, NEW_EXAMPLE_CHAT_ID, GROUP_NUDGE_ID];

#[derive(Debug, Clone, Copy)]
pub enum InsertAt {
    Start,
    End,
    Index(usize),
}

/// Owns the token budget and the root collection. Every add/insert is an
/// atomic check-then-act: a rejected operation leaves budget and tree
/// exactly as they were.
#[derive(Debug)]
pub struct ChatCompletion {
    budget: i64,
    root: MessageCollection,
    trace: bool,
    overrides: Vec<String>,
}

impl ChatCompletion {
    pub fn new() -> Self {
        Self {
            budget: 0,
            root: MessageCollection::new(ROOT_ID),
            trace: false,
            overrides: Vec::new(),
        }
    }

    pub fn with_budget(context_size: u32, response_size: u32) -> Self {
        let mut chat = Self::new();
        chat.set_budget(context_size, response_size);
        chat
    }

    /// May yield a negative budget when the response reservation exceeds the
    /// context; only add/insert validate against it.
    pub fn set_budget(&mut self, context_size: u32, response_size: u32) {
        self.budget = context_size as i64 - response_size as i64;
        self.trace(|| format!("token budget: {}", self.budget));
    }

    pub fn budget(&self) -> i64 {
        self.budget
    }

    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// Records that a stock prompt was replaced by character-supplied text.
    /// Informational only.
    pub fn note_override(&mut self, identifier: impl Into<String>) {
        self.overrides.push(identifier.into());
    }

    pub fn overrides(&self) -> &[String] {
        &self.overrides
    }

    pub fn can_afford_tokens(&self, tokens: u32) -> bool {
        self.budget - tokens as i64 >= 0
    }

    pub fn can_afford(&self, message: &Message) -> bool {
        self.can_afford_tokens(message.tokens())
    }

    pub fn can_afford_all(&self, messages: &[Message]) -> bool {
        self.can_afford_tokens(messages.iter().map(Message::tokens).sum())
    }

    pub fn root(&self) -> &MessageCollection {
        &self.root
    }

    /// Adds a message or collection to the root, appending or replacing the
    /// item at `position`. Fails without mutating when unaffordable.
    pub fn add(
        &mut self,
        item: impl Into<ChatItem>,
        position: Option<usize>,
    ) -> Result<(), PromptError> {
        let item = item.into();
        let tokens = item.tokens();
        if !self.can_afford_tokens(tokens) {
            return Err(PromptError::BudgetExceeded(item.identifier().to_string()));
        }
        self.trace(|| {
            format!(
                "added '{}' ({} tokens, {} remaining)",
                item.identifier(),
                tokens,
                self.budget - tokens as i64
            )
        });
        match position {
            Some(index) => self.root.set(index, item),
            None => self.root.push(item),
        }
        self.budget -= tokens as i64;
        Ok(())
    }

    /// Inserts a message into the named child collection at the given slot.
    pub fn insert(
        &mut self,
        message: Message,
        target: &str,
        at: InsertAt,
    ) -> Result<(), PromptError> {
        let tokens = message.tokens();
        let affordable = self.budget - tokens as i64 >= 0;
        let Some(ChatItem::Collection(collection)) = self.root.get_mut(target) else {
            return Err(PromptError::IdentifierNotFound(target.to_string()));
        };
        if !affordable {
            return Err(PromptError::BudgetExceeded(
                message.identifier().to_string(),
            ));
        }
        let index = match at {
            InsertAt::Start => 0,
            InsertAt::End => collection.len(),
            InsertAt::Index(i) => i.min(collection.len()),
        };
        let identifier = message.identifier().to_string();
        collection.insert(index, message);
        self.budget -= tokens as i64;
        self.trace(|| format!("inserted '{identifier}' into '{target}' ({tokens} tokens)"));
        Ok(())
    }

    pub fn insert_at_start(&mut self, message: Message, target: &str) -> Result<(), PromptError> {
        self.insert(message, target, InsertAt::Start)
    }

    pub fn insert_at_end(&mut self, message: Message, target: &str) -> Result<(), PromptError> {
        self.insert(message, target, InsertAt::End)
    }

    /// Splices a message into the root a relative offset away from the named
    /// anchor item. Used for position-anchored extension content.
    pub fn splice(
        &mut self,
        message: Message,
        anchor: &str,
        offset: i64,
    ) -> Result<(), PromptError> {
        let Some(anchor_index) = self.root.position(anchor) else {
            return Err(PromptError::IdentifierNotFound(anchor.to_string()));
        };
        let tokens = message.tokens();
        if !self.can_afford(&message) {
            return Err(PromptError::BudgetExceeded(
                message.identifier().to_string(),
            ));
        }
        let index = (anchor_index as i64 + offset).clamp(0, self.root.len() as i64) as usize;
        self.root.insert(index, message);
        self.budget -= tokens as i64;
        Ok(())
    }

    /// Pops the last item from the named collection and returns its tokens
    /// to the budget. Popping an empty collection is a quiet no-op.
    pub fn remove_last_from(&mut self, target: &str) -> Result<(), PromptError> {
        let Some(ChatItem::Collection(collection)) = self.root.get_mut(target) else {
            return Err(PromptError::IdentifierNotFound(target.to_string()));
        };
        let Some(removed) = collection.pop() else {
            debug!("remove_last_from('{target}'): collection is empty");
            return Ok(());
        };
        let tokens = removed.tokens();
        self.budget += tokens as i64;
        self.trace(|| {
            format!(
                "removed '{}' from '{target}' ({tokens} tokens returned)",
                removed.identifier()
            )
        });
        Ok(())
    }

    /// Sets tokens aside without attaching content, e.g. for reply priming
    /// overhead or for content whose inclusion is still being decided.
    pub fn reserve(&mut self, tokens: u32) {
        self.budget -= tokens as i64;
        self.trace(|| format!("reserved {tokens} tokens ({} remaining)", self.budget));
    }

    /// Returns previously reserved tokens to the pool.
    pub fn free(&mut self, tokens: u32) {
        self.budget += tokens as i64;
        self.trace(|| format!("freed {tokens} tokens ({} remaining)", self.budget));
    }

    /// Merges runs of consecutive unnamed system messages into one, joining
    /// content with a newline. Chat markers, named messages and multimodal
    /// content are left alone; empty messages are dropped outright. Running
    /// it again on already-squashed output changes nothing.
    pub async fn squash_system_messages(
        &mut self,
        counter: &dyn TokenCounter,
    ) -> Result<(), PromptError> {
        let flat: Vec<Message> = self.root.flatten().into_iter().cloned().collect();
        let mut out: Vec<(Message, bool)> = Vec::with_capacity(flat.len());
        for msg in flat {
            let has_tool_calls = msg.tool_calls().is_some_and(|c| !c.is_empty());
            if msg.content().is_empty() && !has_tool_calls {
                continue;
            }
            let mergeable = msg.role() == Role::System
                && msg.name().is_none()
                && !has_tool_calls
                && matches!(msg.content(), MessageBody::Text(_))
                && !SQUASH_EXCLUDED.contains(&msg.identifier());
            if mergeable && let Some((last, last_mergeable)) = out.last_mut() && *last_mergeable {
                let combined = format!(
                    "{}\n{}",
                    last.content().joined_text(),
                    msg.content().joined_text()
                );
                last.set_text(combined, counter).await?;
                continue;
            }
            out.push((msg, mergeable));
        }
        self.root = MessageCollection::with_items(
            ROOT_ID,
            out.into_iter().map(|(m, _)| m.into()).collect(),
        );
        Ok(())
    }

    /// The final wire-format chat array.
    pub fn chat(&self) -> Vec<ChatMessage> {
        self.root.chat()
    }

    fn trace(&self, line: impl FnOnce() -> String) {
        if self.trace {
            debug!("{}", line());
        }
    }
}

impl Default for ChatCompletion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::HeuristicCounter;
    use async_trait::async_trait;

    /// Deterministic counter: a flat cost per message.
    struct Flat(u32);

    #[async_trait]
    impl crate::tokens::TokenCounter for Flat {
        async fn count(&self, messages: &[ChatMessage]) -> Result<u32, PromptError> {
            Ok(self.0 * messages.len() as u32)
        }
    }

    async fn flat_msg(id: &str, tokens: u32) -> Message {
        Message::new(Role::System, "x", id, &Flat(tokens)).await.unwrap()
    }

    #[tokio::test]
    async fn budget_tracks_adds_removes_and_reservations() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        let mut history = MessageCollection::new("history");
        history.push(flat_msg("h-0", 10).await);
        chat.add(history, None).unwrap();
        assert_eq!(chat.budget(), 90);

        chat.insert_at_end(flat_msg("h-1", 20).await, "history").unwrap();
        assert_eq!(chat.budget(), 70);

        chat.reserve(15);
        assert_eq!(chat.budget(), 55);
        chat.free(15);
        assert_eq!(chat.budget(), 70);

        chat.remove_last_from("history").unwrap();
        assert_eq!(chat.budget(), 90);
    }

    #[tokio::test]
    async fn unaffordable_add_is_atomic() {
        let mut chat = ChatCompletion::with_budget(10, 0);
        let before_chat = chat.chat();

        let err = chat.add(flat_msg("big_prompt", 50).await, None).unwrap_err();
        match err {
            PromptError::BudgetExceeded(id) => assert_eq!(id, "big_prompt"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(chat.budget(), 10);
        assert_eq!(chat.chat().len(), before_chat.len());
    }

    #[tokio::test]
    async fn unaffordable_insert_is_atomic() {
        let mut chat = ChatCompletion::with_budget(30, 0);
        chat.add(MessageCollection::new("history"), None).unwrap();
        chat.insert_at_end(flat_msg("h-0", 20).await, "history").unwrap();

        let err = chat
            .insert_at_start(flat_msg("h-1", 20).await, "history")
            .unwrap_err();
        assert!(matches!(err, PromptError::BudgetExceeded(_)));
        assert_eq!(chat.budget(), 10);
        assert_eq!(chat.chat().len(), 1);
    }

    #[tokio::test]
    async fn insert_at_numeric_index() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        chat.add(MessageCollection::new("history"), None).unwrap();
        chat.insert_at_end(flat_msg("h-0", 5).await, "history").unwrap();
        chat.insert_at_end(flat_msg("h-2", 5).await, "history").unwrap();
        chat.insert(flat_msg("h-1", 5).await, "history", InsertAt::Index(1))
            .unwrap();

        let ids: Vec<&str> = chat.root().flatten().iter().map(|m| m.identifier()).collect();
        assert_eq!(ids, ["h-0", "h-1", "h-2"]);
        assert_eq!(chat.budget(), 85);
    }

    #[tokio::test]
    async fn insert_into_unknown_collection_fails() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        let err = chat
            .insert_at_end(flat_msg("m", 1).await, "nowhere")
            .unwrap_err();
        assert!(matches!(err, PromptError::IdentifierNotFound(_)));
        assert_eq!(chat.budget(), 100);
    }

    #[tokio::test]
    async fn remove_last_from_empty_collection_is_a_no_op() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        chat.add(MessageCollection::new("history"), None).unwrap();
        chat.remove_last_from("history").unwrap();
        assert_eq!(chat.budget(), 100);
    }

    #[tokio::test]
    async fn negative_budget_is_allowed_at_set_time() {
        let chat = ChatCompletion::with_budget(100, 300);
        assert_eq!(chat.budget(), -200);
        assert!(!chat.can_afford_tokens(0));
    }

    #[tokio::test]
    async fn add_with_position_replaces() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        chat.add(flat_msg("first", 5).await, None).unwrap();
        chat.add(flat_msg("second", 5).await, None).unwrap();
        chat.add(flat_msg("replacement", 5).await, Some(0)).unwrap();

        let ids: Vec<String> = chat
            .root()
            .flatten()
            .iter()
            .map(|m| m.identifier().to_string())
            .collect();
        assert_eq!(ids, ["replacement", "second"]);
    }

    #[tokio::test]
    async fn splice_lands_relative_to_anchor() {
        let mut chat = ChatCompletion::with_budget(100, 0);
        chat.add(flat_msg("main", 5).await, None).unwrap();
        chat.add(flat_msg("tail", 5).await, None).unwrap();
        chat.splice(flat_msg("note", 5).await, "main", 1).unwrap();

        let ids: Vec<&str> = chat.root().flatten().iter().map(|m| m.identifier()).collect();
        assert_eq!(ids, ["main", "note", "tail"]);

        let err = chat.splice(flat_msg("lost", 5).await, "absent", 0).unwrap_err();
        assert!(matches!(err, PromptError::IdentifierNotFound(_)));
    }

    async fn sys(content: &str, id: &str) -> Message {
        Message::new(Role::System, content, id, &HeuristicCounter)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn squash_merges_adjacent_unnamed_system_messages() {
        let counter = HeuristicCounter;
        let mut chat = ChatCompletion::with_budget(10_000, 0);
        chat.add(sys("one", "a").await, None).unwrap();
        chat.add(sys("two", "b").await, None).unwrap();
        chat.add(sys("", "blank").await, None).unwrap();
        chat.add(
            Message::new(Role::User, "hi", "u", &counter).await.unwrap(),
            None,
        )
        .unwrap();
        chat.add(sys("three", "c").await, None).unwrap();

        chat.squash_system_messages(&counter).await.unwrap();
        let once: Vec<String> = chat.chat().iter().map(|m| m.text()).collect();
        assert_eq!(once, ["one\ntwo", "hi", "three"]);

        chat.squash_system_messages(&counter).await.unwrap();
        let twice: Vec<String> = chat.chat().iter().map(|m| m.text()).collect();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn squash_leaves_markers_and_named_messages_alone() {
        let counter = HeuristicCounter;
        let mut chat = ChatCompletion::with_budget(10_000, 0);
        chat.add(sys("before", "a").await, None).unwrap();
        chat.add(sys("[Start a new Chat]", NEW_CHAT_ID).await, None).unwrap();
        let mut named = sys("narration", "n").await;
        named.set_name("Narrator", &counter).await.unwrap();
        chat.add(named, None).unwrap();

        chat.squash_system_messages(&counter).await.unwrap();
        assert_eq!(chat.chat().len(), 3);
    }
}
