use super::{
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, ContentPart, LlmProvider,
    MessageBody, ProviderError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
    version: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(base_url: String, api_key: String, version: String, default_model: String) -> Self {
        let client = Client::builder().build().expect("reqwest client");
        Self {
            client,
            base_url,
            api_key,
            version,
            default_model,
        }
    }

    /// System-role messages become the request's system string; the rest map
    /// to user/assistant turns with typed content blocks.
    fn shape(messages: &[ChatMessage]) -> (Option<String>, Vec<ReqMsg>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut shaped: Vec<ReqMsg> = Vec::new();
        for m in messages {
            match m.role.as_str() {
                "system" => {
                    let text = m.text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                "tool" => {
                    if let Some(id) = &m.tool_call_id {
                        let block = serde_json::json!({
                            "type": "tool_result",
                            "tool_use_id": id,
                            "content": m.text(),
                        });
                        shaped.push(ReqMsg {
                            role: "user",
                            content: serde_json::json!([block]),
                        });
                    }
                }
                role => {
                    let mut blocks: Vec<serde_json::Value> = Vec::new();
                    match m.content.as_ref() {
                        Some(MessageBody::Text(text)) => {
                            if !text.is_empty() {
                                blocks.push(serde_json::json!({"type": "text", "text": text}));
                            }
                        }
                        Some(MessageBody::Parts(parts)) => {
                            for part in parts {
                                match part {
                                    ContentPart::Text { text } => blocks
                                        .push(serde_json::json!({"type": "text", "text": text})),
                                    ContentPart::ImageUrl { image_url } => {
                                        if let Some((media_type, data)) =
                                            split_data_uri(&image_url.url)
                                        {
                                            blocks.push(serde_json::json!({
                                                "type": "image",
                                                "source": {
                                                    "type": "base64",
                                                    "media_type": media_type,
                                                    "data": data,
                                                },
                                            }));
                                        }
                                    }
                                    // no video support on this API
                                    ContentPart::VideoUrl { .. } => {}
                                }
                            }
                        }
                        None => {}
                    }
                    if role == "assistant" && let Some(calls) = &m.tool_calls {
                        for call in calls {
                            let input: serde_json::Value =
                                serde_json::from_str(&call.function.arguments)
                                    .unwrap_or(serde_json::Value::Null);
                            blocks.push(serde_json::json!({
                                "type": "tool_use",
                                "id": call.id,
                                "name": call.function.name,
                                "input": input,
                            }));
                        }
                    }
                    if blocks.is_empty() {
                        continue;
                    }
                    shaped.push(ReqMsg {
                        role: if role == "assistant" { "assistant" } else { "user" },
                        content: serde_json::Value::Array(blocks),
                    });
                }
            }
        }
        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, shaped)
    }
}

#[derive(Serialize)]
struct ReqMsg {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<ReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

/// `data:<mime>;base64,<payload>` split without decoding.
fn split_data_uri(uri: &str) -> Option<(&str, &str)> {
    uri.strip_prefix("data:")?.split_once(";base64,")
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        // No public list-models endpoint; return the configured default
        Ok(vec![self.default_model.clone()])
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum RespContent {
            Text { text: String },
            #[serde(other)]
            Other,
        }
        #[derive(Deserialize)]
        struct RespUsage {
            input_tokens: u32,
            output_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            content: Vec<RespContent>,
            usage: Option<RespUsage>,
        }

        let (system, messages) = Self::shape(&req.messages);
        let body = Body {
            model: &req.model,
            messages,
            system,
            max_tokens: req.max_tokens.unwrap_or(1024),
            temperature: req.temperature,
            stream: false,
        };
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp: Resp = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut text_acc = String::new();
        for c in resp.content {
            if let RespContent::Text { text } = c {
                text_acc.push_str(&text);
            }
        }
        let usage = resp.usage.map(|u| super::Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });
        Ok(ChatResponse {
            content: Some(text_acc),
            tool_calls: None,
            usage,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct Delta {
            r#type: String,
            #[serde(default)]
            delta: Option<TextDelta>,
        }
        #[derive(Deserialize)]
        struct TextDelta {
            #[serde(default)]
            text: String,
        }

        let (system, messages) = Self::shape(&req.messages);
        let body = Body {
            model: &req.model,
            messages,
            system,
            max_tokens: req.max_tokens.unwrap_or(1024),
            temperature: req.temperature,
            stream: true,
        };
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let stream = resp
            .bytes_stream()
            .map(|chunk_res| {
                let bytes = match chunk_res {
                    Ok(b) => b,
                    Err(e) => return Err(ProviderError::Http(e)),
                };
                let text = String::from_utf8_lossy(&bytes);
                let mut out = String::new();
                for line in text.split('\n') {
                    let line = line.trim();
                    if !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    if let Ok(ev) = serde_json::from_str::<Delta>(data)
                        && ev.r#type == "content_block_delta"
                        && let Some(d) = ev.delta
                    {
                        out.push_str(&d.text);
                    }
                }
                Ok(ChatDelta {
                    delta: if out.is_empty() { None } else { Some(out) },
                })
            })
            .filter(|res| {
                let has_text = res.as_ref().ok().and_then(|d| d.delta.as_ref()).is_some();
                futures_util::future::ready(has_text || res.is_err())
            })
            .boxed();

        Ok(stream)
    }
}
