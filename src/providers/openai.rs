use super::{
    ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, FunctionCall, LlmProvider,
    ProviderError, ToolCall,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// OpenAI chat-completions adapter. The wire-format chat array emitted by
/// the prompt engine is already in this dialect, so the same adapter serves
/// every OpenAI-compatible endpoint (Groq, DeepSeek, xAI, OpenRouter, ...)
/// under a different provider name and base URL.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl OpenAiProvider {
    pub fn new(base_url: String, api_key: String, default_model: String) -> Self {
        Self::compatible("openai".into(), base_url, api_key, default_model)
    }

    pub fn compatible(
        name: String,
        base_url: String,
        api_key: String,
        default_model: String,
    ) -> Self {
        let client = Client::builder().build().expect("reqwest client");
        Self {
            client,
            name,
            base_url,
            api_key,
            default_model,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct Model {
            id: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            data: Vec<Model>,
        }
        let resp: Resp = self
            .client
            .get(self.url("/models"))
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.data.into_iter().map(|m| m.id).collect())
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
            #[serde(default)]
            tool_calls: Vec<ChoiceToolCall>,
        }
        #[derive(Deserialize)]
        struct ChoiceToolCall {
            id: String,
            function: ChoiceFunction,
        }
        #[derive(Deserialize)]
        struct ChoiceFunction {
            name: String,
            arguments: String,
        }
        #[derive(Deserialize)]
        struct RespUsage {
            prompt_tokens: u32,
            completion_tokens: u32,
            total_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
            usage: Option<RespUsage>,
        }

        let body = Body {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
        };
        let resp: Resp = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let usage = resp.usage.map(|u| super::Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        let message = resp.choices.into_iter().next().map(|c| c.message);
        let content = message.as_ref().and_then(|m| m.content.clone());
        let tool_calls = message
            .map(|m| {
                m.tool_calls
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: tc.id,
                        kind: "function".into(),
                        function: FunctionCall {
                            name: tc.function.name,
                            arguments: tc.function.arguments,
                        },
                    })
                    .collect()
            })
            .filter(|v: &Vec<_>| !v.is_empty());
        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct DeltaMsg {
            content: Option<String>,
        }
        #[derive(Deserialize)]
        struct Choice {
            delta: DeltaMsg,
        }
        #[derive(Deserialize)]
        struct Chunk {
            choices: Vec<Choice>,
        }

        let body = Body {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: true,
        };
        let resp = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
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
                // SSE: lines starting with "data: " and a final [DONE]
                let mut acc = String::new();
                for line in text.split('\n') {
                    let line = line.trim();
                    if !line.starts_with("data:") {
                        continue;
                    }
                    let data = line.trim_start_matches("data:").trim();
                    if data == "[DONE]" {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<Chunk>(data) {
                        for choice in chunk.choices {
                            if let Some(content) = choice.delta.content {
                                acc.push_str(&content);
                            }
                        }
                    }
                }
                Ok(ChatDelta {
                    delta: if acc.is_empty() { None } else { Some(acc) },
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
