use super::message::Message;
use crate::providers::ChatMessage;

/// A child slot in a collection: a single turn or a nested named group.
#[derive(Debug, Clone)]
pub enum ChatItem {
    Message(Message),
    Collection(MessageCollection),
}

impl ChatItem {
    pub fn identifier(&self) -> &str {
        match self {
            ChatItem::Message(m) => m.identifier(),
            ChatItem::Collection(c) => c.identifier(),
        }
    }

    pub fn tokens(&self) -> u32 {
        match self {
            ChatItem::Message(m) => m.tokens(),
            ChatItem::Collection(c) => c.tokens(),
        }
    }
}

impl From<Message> for ChatItem {
    fn from(m: Message) -> Self {
        ChatItem::Message(m)
    }
}

impl From<MessageCollection> for ChatItem {
    fn from(c: MessageCollection) -> Self {
        ChatItem::Collection(c)
    }
}

/// Named, ordered container of messages and nested collections. Child order
/// is insertion order and carries through to the flattened chat array.
#[derive(Debug, Clone)]
pub struct MessageCollection {
    identifier: String,
    items: Vec<ChatItem>,
}

impl MessageCollection {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            items: Vec::new(),
        }
    }

    pub fn with_items(identifier: impl Into<String>, items: Vec<ChatItem>) -> Self {
        Self {
            identifier: identifier.into(),
            items,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn push(&mut self, item: impl Into<ChatItem>) {
        self.items.push(item.into());
    }

    pub fn insert(&mut self, index: usize, item: impl Into<ChatItem>) {
        let index = index.min(self.items.len());
        self.items.insert(index, item.into());
    }

    pub fn pop(&mut self) -> Option<ChatItem> {
        self.items.pop()
    }

    /// Replaces the item at `index`, or appends when the index is past the end.
    pub fn set(&mut self, index: usize, item: impl Into<ChatItem>) {
        if index < self.items.len() {
            self.items[index] = item.into();
        } else {
            self.items.push(item.into());
        }
    }

    pub fn items(&self) -> &[ChatItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Direct-children lookup only; nested collections are not searched.
    pub fn get(&self, identifier: &str) -> Option<&ChatItem> {
        self.items.iter().find(|i| i.identifier() == identifier)
    }

    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut ChatItem> {
        self.items.iter_mut().find(|i| i.identifier() == identifier)
    }

    pub fn has(&self, identifier: &str) -> bool {
        self.get(identifier).is_some()
    }

    pub fn position(&self, identifier: &str) -> Option<usize> {
        self.items.iter().position(|i| i.identifier() == identifier)
    }

    /// Recursive token sum over all descendant messages.
    pub fn tokens(&self) -> u32 {
        self.items.iter().map(|i| i.tokens()).sum()
    }

    /// Depth-first message leaves in emission order.
    pub fn flatten(&self) -> Vec<&Message> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Message>) {
        for item in &self.items {
            match item {
                ChatItem::Message(m) => out.push(m),
                ChatItem::Collection(c) => c.flatten_into(out),
            }
        }
    }

    /// Wire-format chat array. Entries with neither content nor tool calls
    /// are skipped, not an error.
    pub fn chat(&self) -> Vec<ChatMessage> {
        self.flatten().into_iter().filter_map(Message::to_wire).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::message::Role;
    use crate::tokens::HeuristicCounter;

    async fn msg(role: Role, content: &str, id: &str) -> Message {
        Message::new(role, content, id, &HeuristicCounter).await.unwrap()
    }

    #[tokio::test]
    async fn flatten_preserves_depth_first_insertion_order() {
        let mut nested = MessageCollection::new("inner");
        nested.push(msg(Role::User, "second", "b").await);
        nested.push(msg(Role::Assistant, "third", "c").await);

        let mut root = MessageCollection::new("root");
        root.push(msg(Role::System, "first", "a").await);
        root.push(nested);
        root.push(msg(Role::User, "fourth", "d").await);

        let order: Vec<&str> = root.flatten().iter().map(|m| m.identifier()).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn tokens_sum_recursively() {
        let a = msg(Role::User, "aaaa bbbb", "a").await;
        let b = msg(Role::User, "cccc dddd", "b").await;
        let expected = a.tokens() + b.tokens();

        let inner = MessageCollection::with_items("inner", vec![b.into()]);
        let root = MessageCollection::with_items("root", vec![a.into(), inner.into()]);
        assert_eq!(root.tokens(), expected);
    }

    #[tokio::test]
    async fn lookup_is_not_recursive() {
        let inner =
            MessageCollection::with_items("inner", vec![msg(Role::User, "x", "hidden").await.into()]);
        let root = MessageCollection::with_items("root", vec![inner.into()]);
        assert!(root.has("inner"));
        assert!(!root.has("hidden"));
    }

    #[tokio::test]
    async fn chat_skips_empty_messages() {
        let mut root = MessageCollection::new("root");
        root.push(msg(Role::System, "", "blank").await);
        root.push(msg(Role::User, "hello", "greeting").await);
        let chat = root.chat();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].text(), "hello");
    }

    #[tokio::test]
    async fn tool_role_gets_tool_call_id_from_identifier() {
        let mut root = MessageCollection::new("root");
        root.push(msg(Role::Tool, "{\"ok\":true}", "call_123").await);
        let chat = root.chat();
        assert_eq!(chat[0].tool_call_id.as_deref(), Some("call_123"));
    }
}
