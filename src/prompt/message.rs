use log::warn;

use super::PromptError;
use crate::media::{MediaFetcher, image_dimensions};
use crate::providers::{
    ChatMessage, ContentPart, FunctionCall, ImageRef, MessageBody, ToolCall, VideoRef,
};
use crate::tokens::TokenCounter;

/// Flat fallback cost when image dimensions cannot be determined.
pub const IMAGE_TOKEN_FALLBACK: u32 = 85;
/// Conservative flat cost for video attachments; true duration is unknown.
pub const VIDEO_TOKEN_COST: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Lenient parse: a missing or unrecognized role becomes System.
    pub fn parse_or_default(role: Option<&str>) -> Self {
        role.and_then(|r| Self::try_parse(r).ok()).unwrap_or(Role::System)
    }

    pub fn try_parse(role: &str) -> Result<Self, PromptError> {
        match role {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(PromptError::InvalidArgument(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageQuality {
    Low,
    #[default]
    Auto,
    High,
}

impl ImageQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageQuality::Low => "low",
            ImageQuality::Auto => "auto",
            ImageQuality::High => "high",
        }
    }

    pub fn try_parse(s: &str) -> Result<Self, PromptError> {
        match s {
            "low" => Ok(ImageQuality::Low),
            "auto" => Ok(ImageQuality::Auto),
            "high" => Ok(ImageQuality::High),
            other => Err(PromptError::InvalidArgument(format!(
                "unknown image quality: {other}"
            ))),
        }
    }
}

/// A tool invocation as recorded in chat history, before wire shaping.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub parameters: String,
}

/// One prompt turn. The token count always reflects the current content,
/// name and tool calls as measured at the last mutation.
#[derive(Debug, Clone)]
pub struct Message {
    role: Role,
    content: MessageBody,
    identifier: String,
    name: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    text_tokens: u32,
    media_tokens: u32,
}

impl Message {
    /// Builds a message and prices it. Empty content costs nothing and
    /// skips the counter entirely.
    pub async fn new(
        role: Role,
        content: impl Into<String>,
        identifier: impl Into<String>,
        counter: &dyn TokenCounter,
    ) -> Result<Self, PromptError> {
        let mut msg = Self {
            role,
            content: MessageBody::Text(content.into()),
            identifier: identifier.into(),
            name: None,
            tool_calls: None,
            text_tokens: 0,
            media_tokens: 0,
        };
        if !msg.content.is_empty() {
            msg.recount(counter).await?;
        }
        Ok(msg)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn content(&self) -> &MessageBody {
        &self.content
    }

    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        self.tool_calls.as_deref()
    }

    pub fn tokens(&self) -> u32 {
        self.text_tokens + self.media_tokens
    }

    /// Replaces the textual content wholesale and reprices. Attached media
    /// parts are preserved.
    pub async fn set_text(
        &mut self,
        text: impl Into<String>,
        counter: &dyn TokenCounter,
    ) -> Result<(), PromptError> {
        let text = text.into();
        match &mut self.content {
            MessageBody::Text(t) => *t = text,
            MessageBody::Parts(parts) => {
                parts.retain(|p| !matches!(p, ContentPart::Text { .. }));
                parts.insert(0, ContentPart::Text { text });
            }
        }
        self.recount(counter).await
    }

    pub async fn set_name(
        &mut self,
        name: impl Into<String>,
        counter: &dyn TokenCounter,
    ) -> Result<(), PromptError> {
        self.name = Some(name.into());
        self.recount(counter).await
    }

    /// Shapes invocations into wire tool calls and reprices over
    /// {role, tool calls}.
    pub async fn set_tool_calls(
        &mut self,
        invocations: Vec<ToolInvocation>,
        counter: &dyn TokenCounter,
    ) -> Result<(), PromptError> {
        let calls = invocations
            .into_iter()
            .map(|inv| ToolCall {
                id: inv.id,
                kind: "function".into(),
                function: FunctionCall {
                    name: inv.name,
                    arguments: inv.parameters,
                },
            })
            .collect();
        self.tool_calls = Some(calls);
        self.recount(counter).await
    }

    /// Attaches an image. The reference is resolved to an inline data URI;
    /// any failure along the way is absorbed and the image is simply not
    /// attached. Cost errors degrade to the flat fallback constant.
    pub async fn add_image(
        &mut self,
        reference: &str,
        quality: ImageQuality,
        fetcher: &dyn MediaFetcher,
    ) {
        let media = match fetcher.fetch(reference).await {
            Ok(m) => m,
            Err(e) => {
                warn!("image fetch failed for '{reference}': {e}");
                return;
            }
        };
        let cost = match quality {
            ImageQuality::Low => IMAGE_TOKEN_FALLBACK,
            _ => match image_dimensions(&media.bytes) {
                Some((w, h)) => image_token_cost(w, h, quality),
                None => IMAGE_TOKEN_FALLBACK,
            },
        };
        self.push_part(ContentPart::ImageUrl {
            image_url: ImageRef {
                url: media.to_data_uri(),
                detail: Some(quality.as_str().into()),
            },
        });
        self.media_tokens += cost;
    }

    /// Attaches a video at a flat conservative cost. No compression, no
    /// duration probing.
    pub async fn add_video(&mut self, reference: &str, fetcher: &dyn MediaFetcher) {
        let media = match fetcher.fetch(reference).await {
            Ok(m) => m,
            Err(e) => {
                warn!("video fetch failed for '{reference}': {e}");
                return;
            }
        };
        self.push_part(ContentPart::VideoUrl {
            video_url: VideoRef {
                url: media.to_data_uri(),
            },
        });
        self.media_tokens += VIDEO_TOKEN_COST;
    }

    fn push_part(&mut self, part: ContentPart) {
        if let MessageBody::Parts(parts) = &mut self.content {
            parts.push(part);
            return;
        }
        let text = self.content.joined_text();
        let mut parts = Vec::with_capacity(2);
        if !text.is_empty() {
            parts.push(ContentPart::Text { text });
        }
        parts.push(part);
        self.content = MessageBody::Parts(parts);
    }

    async fn recount(&mut self, counter: &dyn TokenCounter) -> Result<(), PromptError> {
        let probe = ChatMessage {
            role: self.role.as_str().into(),
            content: Some(MessageBody::Text(self.content.joined_text())),
            name: self.name.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: None,
        };
        self.text_tokens = counter.count(&[probe]).await?;
        Ok(())
    }

    /// Wire-format view. Entries with neither content nor tool calls yield
    /// `None` and are skipped by emitters.
    pub fn to_wire(&self) -> Option<ChatMessage> {
        let has_content = !self.content.is_empty();
        let has_tool_calls = self.tool_calls.as_ref().is_some_and(|c| !c.is_empty());
        if !has_content && !has_tool_calls {
            return None;
        }
        Some(ChatMessage {
            role: self.role.as_str().into(),
            content: has_content.then(|| self.content.clone()),
            name: self.name.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: (self.role == Role::Tool).then(|| self.identifier.clone()),
        })
    }
}

/// OpenAI-style tiling cost. Low quality is flat; auto quality images that
/// fit in a single 512px tile are flat; anything else is fitted within
/// 2048x2048, rescaled so the shorter side is 768px, and tiled in 512px
/// squares at 170 tokens per tile plus the base 85.
pub fn image_token_cost(width: u32, height: u32, quality: ImageQuality) -> u32 {
    match quality {
        ImageQuality::Low => IMAGE_TOKEN_FALLBACK,
        ImageQuality::Auto if width <= 512 && height <= 512 => IMAGE_TOKEN_FALLBACK,
        _ => {
            let mut w = width as f64;
            let mut h = height as f64;
            if w > 2048.0 || h > 2048.0 {
                let scale = 2048.0 / w.max(h);
                w *= scale;
                h *= scale;
            }
            let scale = 768.0 / w.min(h);
            w *= scale;
            h *= scale;
            let tiles = (w / 512.0).ceil() * (h / 512.0).ceil();
            tiles as u32 * 170 + 85
        }
    }
}
