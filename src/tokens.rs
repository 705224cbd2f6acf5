use crate::prompt::PromptError;
use crate::providers::ChatMessage;
use async_trait::async_trait;

/// Counts prompt tokens for wire-format messages. Implementations must be
/// deterministic for identical input under a fixed model selection.
///
/// Media parts are not counted here; the prompt engine prices images and
/// video with its own cost formulas.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count(&self, messages: &[ChatMessage]) -> Result<u32, PromptError>;
}

// Very rough token estimator: ~4 chars per token + small overhead per message
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    (chars / 4).max(1)
}

/// Default counter when no model tokenizer is wired up.
pub struct HeuristicCounter;

#[async_trait]
impl TokenCounter for HeuristicCounter {
    async fn count(&self, messages: &[ChatMessage]) -> Result<u32, PromptError> {
        let mut total = 0u32;
        for m in messages {
            total += 6; // overhead per message (very rough)
            if let Some(body) = &m.content {
                let text = body.joined_text();
                if !text.is_empty() {
                    total += estimate_tokens(&text);
                }
            }
            if let Some(name) = &m.name {
                total += estimate_tokens(name);
            }
            if let Some(calls) = &m.tool_calls {
                for call in calls {
                    total += estimate_tokens(&call.function.name);
                    total += estimate_tokens(&call.function.arguments);
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("a"), 1);
    }

    #[tokio::test]
    async fn counts_name_and_tool_calls() {
        let counter = HeuristicCounter;
        let plain = ChatMessage::user("hello world!");
        let base = counter.count(std::slice::from_ref(&plain)).await.unwrap();

        let mut named = plain.clone();
        named.name = Some("Alice".into());
        let with_name = counter.count(&[named]).await.unwrap();
        assert!(with_name > base);
    }
}
