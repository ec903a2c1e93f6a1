use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigGenerator;
use crate::credentials::CredentialStore;
use crate::error::{ProviderError, Result};
use crate::form::SettingsForm;
use crate::models::{ChatReply, Message, ResolvedProvider};

/** \brief 默认读超时；反向代理侧建议不低于 60 秒。 */
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DONE_MARKER: &str = "[DONE]";

/**
 * \brief 流式响应中的一个增量。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ChatDelta>> + Send>>;
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<ChoiceContent>,
    #[serde(default)]
    delta: Option<ChoiceContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceContent {
    #[serde(default)]
    content: Option<String>,
}

/**
 * \brief 构造 HTTP 客户端：连接超时固定，读超时可配置，不做自动重试。
 */
pub fn http_client(read_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(read_timeout)
        .build()
        .map_err(|e| ProviderError::Config(format!("failed to build http client: {}", e)))
}

/**
 * \brief 请求路由：读取生成的配置、解析凭据，并把请求发往配置的基地址。
 */
#[derive(Clone)]
pub struct RequestRouter {
    client: Client,
    generator: ConfigGenerator,
    store: Arc<dyn CredentialStore>,
}

impl RequestRouter {
    pub fn new(
        generator: ConfigGenerator,
        store: Arc<dyn CredentialStore>,
        read_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client(read_timeout)?,
            generator,
            store,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn generator(&self) -> &ConfigGenerator {
        &self.generator
    }

    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /**
     * \brief 在请求开始时取当前配置与密钥的快照。
     */
    pub fn resolve_active(&self) -> Result<ResolvedProvider> {
        let profile = self.generator.load()?.ok_or(ProviderError::NotConfigured)?;
        let api_key = match profile.api_key_ref.as_ref() {
            Some(key_ref) => Some(self.store.resolve(key_ref)?.ok_or_else(|| {
                ProviderError::CredentialStoreUnavailable(format!(
                    "no secret found for {}, reconnect the provider",
                    key_ref
                ))
            })?),
            None => None,
        };
        Ok(ResolvedProvider {
            name: profile.name,
            base_url: profile.base_url,
            model_id: profile.model_id,
            api_key,
        })
    }

    pub async fn chat_once(&self, messages: &[Message]) -> Result<ChatReply> {
        let provider = self.resolve_active()?;
        chat_once(&self.client, &provider, messages).await
    }

    pub async fn stream_events(&self, messages: &[Message]) -> Result<DeltaStream> {
        let provider = self.resolve_active()?;
        stream_events(&self.client, &provider, messages).await
    }

    pub async fn stream_chat(&self, messages: &[Message]) -> Result<TextStream> {
        let provider = self.resolve_active()?;
        stream_chat(&self.client, &provider, messages).await
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let provider = self.resolve_active()?;
        list_models(&self.client, &provider).await
    }

    /**
     * \brief 对当前 Provider 做连接测试。
     */
    pub async fn health(&self) -> Result<HealthReport> {
        let provider = self.resolve_active()?;
        Ok(health_check(&self.client, &provider).await)
    }
}

/**
 * \brief 连接测试结果；不包含密钥。
 */
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub provider: String,
    pub base: String,
    pub model: String,
    pub models: usize,
    /** \brief 模型 ID 是否出现在远端列表中（仅供参考，不做强制校验） */
    pub model_listed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/**
 * \brief 通过列出模型检查 Provider 可用性。
 */
pub async fn health_check(client: &Client, provider: &ResolvedProvider) -> HealthReport {
    let mut report = HealthReport {
        ok: false,
        provider: provider.name.clone(),
        base: provider.base_url.clone(),
        model: provider.model_id.clone(),
        models: 0,
        model_listed: false,
        error: None,
        hint: None,
    };
    match list_models(client, provider).await {
        Ok(list) => {
            report.ok = true;
            report.models = list.len();
            report.model_listed = list.iter().any(|m| *m == provider.model_id);
        }
        Err(e) => {
            report.hint = e.hint().map(str::to_string);
            report.error = Some(e.to_string());
        }
    }
    report
}

/**
 * \brief 未保存表单的连接测试，不触及凭据库与配置文件。
 */
pub async fn health_preview(client: &Client, form: &SettingsForm) -> Result<HealthReport> {
    let provider = form.validate()?.into_resolved();
    Ok(health_check(client, &provider).await)
}

/**
 * \brief 非流式调用，返回完整回复。
 */
pub async fn chat_once(
    client: &Client,
    provider: &ResolvedProvider,
    messages: &[Message],
) -> Result<ChatReply> {
    let url = provider.endpoint("chat/completions");
    tracing::debug!(target: "openwork::llm", %url, model = %provider.model_id, messages = messages.len(), "chat completion");
    let body = ChatRequest {
        model: &provider.model_id,
        messages,
        stream: false,
    };
    let resp = authorized(client.post(&url), provider)
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| connection_failed(&url, e))?;
    let resp = check_status(resp).await?;
    let text = resp.text().await.map_err(|e| connection_failed(&url, e))?;
    parse_completion(&text)
}

/**
 * \brief 流式调用，逐个返回增量（含 finish_reason 等元信息）。
 */
pub async fn stream_events(
    client: &Client,
    provider: &ResolvedProvider,
    messages: &[Message],
) -> Result<DeltaStream> {
    let url = provider.endpoint("chat/completions");
    tracing::debug!(target: "openwork::llm", %url, model = %provider.model_id, messages = messages.len(), "streaming chat completion");
    let body = ChatRequest {
        model: &provider.model_id,
        messages,
        stream: true,
    };
    let resp = authorized(client.post(&url), provider)
        .header(CONTENT_TYPE, "application/json")
        .json(&body)
        .send()
        .await
        .map_err(|e| connection_failed(&url, e))?;
    let resp = check_status(resp).await?;

    let mut bytes = resp.bytes_stream();
    let out = try_stream! {
        let mut decoder = SseDecoder::default();
        let mut done = false;
        while !done {
            let Some(chunk) = bytes.next().await else {
                break;
            };
            let chunk = chunk.map_err(|e| connection_failed(&url, e))?;
            for data in decoder.push(&chunk) {
                if data.trim() == DONE_MARKER {
                    done = true;
                    break;
                }
                if let Some(delta) = parse_stream_chunk(&data)? {
                    yield delta;
                }
            }
        }
        if !done {
            if let Some(data) = decoder.finish() {
                if data.trim() != DONE_MARKER {
                    if let Some(delta) = parse_stream_chunk(&data)? {
                        yield delta;
                    }
                }
            }
        }
    };

    Ok(Box::pin(out))
}

/**
 * \brief 以统一接口返回文本增量。
 */
pub async fn stream_chat(
    client: &Client,
    provider: &ResolvedProvider,
    messages: &[Message],
) -> Result<TextStream> {
    let events = stream_events(client, provider, messages).await?;
    let text = events.try_filter_map(|delta| async move {
        Ok::<_, ProviderError>(delta.content.filter(|c| !c.is_empty()))
    });
    Ok(Box::pin(text))
}

/**
 * \brief 把流式增量重组为一条完整回复。
 */
pub async fn collect_stream(mut stream: DeltaStream) -> Result<ChatReply> {
    let mut reply = ChatReply::default();
    while let Some(delta) = stream.next().await.transpose()? {
        if let Some(content) = delta.content {
            reply.content.push_str(&content);
        }
        if reply.model.is_none() {
            reply.model = delta.model;
        }
        if delta.finish_reason.is_some() {
            reply.finish_reason = delta.finish_reason;
        }
    }
    Ok(reply)
}

/**
 * \brief 列出 Provider 可用模型（`GET {base}/models`）。
 */
pub async fn list_models(client: &Client, provider: &ResolvedProvider) -> Result<Vec<String>> {
    let url = provider.endpoint("models");
    tracing::debug!(target: "openwork::llm", %url, "list models");
    let resp = authorized(client.get(&url), provider)
        .send()
        .await
        .map_err(|e| connection_failed(&url, e))?;
    let resp = check_status(resp).await?;
    let text = resp.text().await.map_err(|e| connection_failed(&url, e))?;
    let v: Value = serde_json::from_str(&text)
        .map_err(|e| ProviderError::MalformedStream(format!("models payload: {}", e)))?;
    parse_model_list(v)
}

fn authorized(builder: RequestBuilder, provider: &ResolvedProvider) -> RequestBuilder {
    match provider.api_key.as_deref() {
        Some(key) => builder.header(AUTHORIZATION, format!("Bearer {}", key)),
        None => builder,
    }
}

fn connection_failed(url: &str, err: reqwest::Error) -> ProviderError {
    tracing::warn!(target: "openwork::llm", %url, error = %err, "request failed");
    ProviderError::ConnectionFailed {
        url: url.to_string(),
        message: err.to_string(),
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = extract_error_message(&text).unwrap_or(text);
    tracing::warn!(target: "openwork::llm", status = status.as_u16(), %message, "provider returned error status");
    match status.as_u16() {
        401 | 403 => Err(ProviderError::AuthenticationFailed {
            status: status.as_u16(),
            message,
        }),
        code => Err(ProviderError::ModelInvocationFailed {
            status: code,
            message,
        }),
    }
}

/**
 * \brief 兼容 `{"error":{"message":..}}`、`{"error":".."}` 与 `{"message":..}` 三种错误体。
 */
fn extract_error_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    let err = v.get("error").unwrap_or(&v);
    err.get("message")
        .and_then(|m| m.as_str())
        .or_else(|| err.as_str())
        .map(str::to_string)
}

fn parse_completion(text: &str) -> Result<ChatReply> {
    let resp: CompletionResponse = serde_json::from_str(text)
        .map_err(|e| ProviderError::MalformedStream(format!("completion payload: {}", e)))?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::MalformedStream("completion has no choices".into()))?;
    Ok(ChatReply {
        content: choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default(),
        model: resp.model,
        finish_reason: choice.finish_reason,
    })
}

fn parse_stream_chunk(data: &str) -> Result<Option<ChatDelta>> {
    let v: Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::MalformedStream(format!("{}: {}", e, data)))?;
    if v.get("error").is_some() {
        let message = extract_error_message(data).unwrap_or_else(|| data.to_string());
        return Err(ProviderError::ModelInvocationFailed {
            status: 200,
            message,
        });
    }
    let chunk: CompletionResponse = serde_json::from_value(v)
        .map_err(|e| ProviderError::MalformedStream(format!("{}: {}", e, data)))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        // usage 等无 choices 的块
        return Ok(None);
    };
    Ok(Some(ChatDelta {
        content: choice.delta.and_then(|d| d.content),
        model: chunk.model,
        finish_reason: choice.finish_reason,
    }))
}

fn parse_model_list(v: Value) -> Result<Vec<String>> {
    let items = if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        arr
    } else if let Some(arr) = v.as_array() {
        arr
    } else {
        return Err(ProviderError::MalformedStream(format!(
            "unexpected models payload: {}",
            v
        )));
    };
    Ok(items
        .iter()
        .filter_map(|item| {
            item.get("id")
                .and_then(|s| s.as_str())
                .or_else(|| item.as_str())
        })
        .map(str::to_string)
        .collect())
}

/**
 * \brief 增量 SSE 解码器：按空行切分事件，返回每个事件的 data 内容。
 * \details 多行 data 以 `\n` 拼接；注释行与其他字段被忽略。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /** \brief 已扫描过、不含事件分隔符的前缀长度 */
    scanned: usize,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // JSON 中的 \r 总是转义过的，裸 \r 只会是行尾
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        // 分隔符可能跨越上次的末尾，回退一个字节
        let mut from = self.scanned.saturating_sub(1);
        while let Some(pos) = find_double_newline(&self.buf[from..]).map(|p| p + from) {
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(data) = extract_data(&block) {
                events.push(data);
            }
            from = 0;
        }
        self.scanned = self.buf.len();
        events
    }

    /**
     * \brief 连接关闭时处理末尾未以空行结束的事件。
     */
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buf);
        self.scanned = 0;
        extract_data(&block)
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .peekable();
    lines.peek()?;
    Some(lines.collect::<Vec<_>>().join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_handles_split_chunks() {
        let mut dec = SseDecoder::default();
        assert!(dec.push(b"data: {\"a\"").is_empty());
        assert!(dec.push(b":1}\n").is_empty());
        let events = dec.push(b"\ndata: [DONE]\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
        assert!(dec.finish().is_none());
    }

    #[test]
    fn test_sse_decoder_byte_at_a_time() {
        let body = b"data: {\"x\":\"abc\"}\n\ndata: two\n\ndata: [DONE]\n\n";
        let mut dec = SseDecoder::default();
        let mut events = Vec::new();
        for b in body.iter() {
            events.extend(dec.push(std::slice::from_ref(b)));
        }
        assert_eq!(events, vec!["{\"x\":\"abc\"}", "two", "[DONE]"]);
        assert!(dec.finish().is_none());
    }

    #[test]
    fn test_sse_decoder_crlf_comments_and_multiline() {
        let mut dec = SseDecoder::default();
        let events = dec.push(b": keep-alive\r\n\r\nevent: message\r\ndata: one\r\ndata: two\r\n\r\n");
        assert_eq!(events, vec!["one\ntwo".to_string()]);
        dec.push(b"data: tail");
        assert_eq!(dec.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn test_parse_stream_chunk_variants() {
        let delta = parse_stream_chunk(
            r#"{"model":"m","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(delta.content.as_deref(), Some("Hi"));
        assert_eq!(delta.model.as_deref(), Some("m"));

        assert!(parse_stream_chunk(r#"{"choices":[],"usage":{"total_tokens":3}}"#)
            .unwrap()
            .is_none());
        assert!(matches!(
            parse_stream_chunk("{oops"),
            Err(ProviderError::MalformedStream(_))
        ));
        assert!(matches!(
            parse_stream_chunk(r#"{"error":{"message":"model not found"}}"#),
            Err(ProviderError::ModelInvocationFailed { .. })
        ));
    }

    #[test]
    fn test_parse_completion_and_errors() {
        let reply = parse_completion(
            r#"{"model":"m","choices":[{"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(reply.content, "ok");
        assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
        assert!(parse_completion(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn test_parse_model_list_shapes() {
        let v = serde_json::json!({"object":"list","data":[{"id":"a"},{"id":"b"}]});
        assert_eq!(parse_model_list(v).unwrap(), vec!["a", "b"]);
        let v = serde_json::json!(["x", {"id": "y"}]);
        assert_eq!(parse_model_list(v).unwrap(), vec!["x", "y"]);
        assert!(parse_model_list(serde_json::json!({"models": 1})).is_err());
    }

    #[test]
    fn test_extract_error_message_shapes() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"bad key"}}"#).as_deref(),
            Some("bad key")
        );
        assert_eq!(
            extract_error_message(r#"{"error":"nope"}"#).as_deref(),
            Some("nope")
        );
        assert_eq!(
            extract_error_message(r#"{"message":"plain"}"#).as_deref(),
            Some("plain")
        );
        assert!(extract_error_message("not json").is_none());
    }
}
