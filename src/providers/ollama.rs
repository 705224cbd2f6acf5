use super::{ChatDelta, ChatMessage, ChatRequest, ChatResponse, ChatStream, LlmProvider, ProviderError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    default_model: String,
}

impl OllamaProvider {
    pub fn new(base_url: String, default_model: String) -> Self {
        let client = Client::builder().build().expect("reqwest client");
        Self {
            client,
            base_url,
            default_model,
        }
    }
}

#[derive(Serialize)]
struct Msg {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Serialize, Default)]
struct Options {
    temperature: Option<f32>,
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct Body<'a> {
    model: &'a str,
    messages: Vec<Msg>,
    stream: bool,
    options: Options,
}

/// Ollama takes flat text plus a bare-base64 image list per message.
fn shape(messages: &[ChatMessage]) -> Vec<Msg> {
    messages
        .iter()
        .map(|m| {
            let images: Vec<String> = m
                .content
                .as_ref()
                .map(|body| {
                    body.image_urls()
                        .into_iter()
                        .filter_map(|url| url.split_once(";base64,").map(|(_, data)| data.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Msg {
                role: m.role.clone(),
                content: m.text(),
                images: if images.is_empty() { None } else { Some(images) },
            }
        })
        .collect()
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }
    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        #[derive(Deserialize)]
        struct Model {
            name: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            models: Vec<Model>,
        }
        let url = format!("{}/api/tags", self.base_url.trim_end_matches('/'));
        let resp: Resp = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.models.into_iter().map(|m| m.name).collect())
    }

    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        #[derive(Deserialize)]
        struct RespMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            message: RespMsg,
        }

        let body = Body {
            model: &req.model,
            messages: shape(&req.messages),
            stream: false,
            options: Options {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let resp: Resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(ChatResponse {
            content: Some(resp.message.content),
            tool_calls: None,
            usage: None,
        })
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<ChatStream, ProviderError> {
        #[derive(Deserialize)]
        struct ChunkMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Chunk {
            message: Option<ChunkMsg>,
        }

        let body = Body {
            model: &req.model,
            messages: shape(&req.messages),
            stream: true,
            options: Options {
                temperature: req.temperature,
                num_predict: req.max_tokens,
            },
        };

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let stream = resp
            .bytes_stream()
            .map(|res| {
                let bytes = match res {
                    Ok(b) => b,
                    Err(e) => return Err(ProviderError::Http(e)),
                };
                let text = String::from_utf8_lossy(&bytes);
                // Ollama streams NDJSON lines
                let mut acc = String::new();
                for line in text.split('\n') {
                    let l = line.trim();
                    if l.is_empty() {
                        continue;
                    }
                    if let Ok(chunk) = serde_json::from_str::<Chunk>(l)
                        && let Some(msg) = chunk.message
                    {
                        acc.push_str(&msg.content);
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
