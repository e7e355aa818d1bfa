use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt, stream};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::provider::{
    ChannelEvent, ChannelRequest, EventStream, LlmError, LlmResult, ModelChannel, StopReason,
    ToolDeclaration,
};
use crate::agent::history::{ContentBlock, Role, Turn};
use crate::http::client::HttpClient;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ERROR_BODY_LIMIT: usize = 400;

#[derive(Debug, Clone)]
pub struct AnthropicChannel {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicChannel {
    pub fn new(
        http: HttpClient,
        api_key: Option<String>,
        model: String,
        base_url: String,
    ) -> LlmResult<Self> {
        let api_key = api_key
            .filter(|v| !v.trim().is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        Ok(Self {
            http,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn build_request(&self, request: &ChannelRequest) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: wire_messages(&request.history),
            tools: request.tools.iter().map(WireTool::from).collect(),
            thinking: request.thinking_budget.map(|budget_tokens| WireThinking {
                kind: "enabled",
                budget_tokens,
            }),
            stream: true,
        }
    }
}

impl ModelChannel for AnthropicChannel {
    async fn stream(&self, request: ChannelRequest) -> LlmResult<EventStream> {
        let payload = self.build_request(&request);
        let headers = [
            ("x-api-key", self.api_key.as_str()),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];

        let response = self
            .http
            .post_json_stream(&self.endpoint(), &headers, &payload)
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            self.http.log_response_body(&body);
            let body = body.chars().take(ERROR_BODY_LIMIT).collect::<String>();
            return Err(LlmError::HttpStatus { status, body });
        }

        Ok(decode_response(self.http.clone(), response))
    }
}

/// Serializes history for the wire. Tool-result turns travel as `user` messages and
/// adjacent messages with the same wire role are merged.
fn wire_messages(history: &[Turn]) -> Vec<WireMessage> {
    let mut messages: Vec<WireMessage> = Vec::new();

    for turn in history {
        let role = match turn.role() {
            Role::User | Role::ToolResult => "user",
            Role::Assistant => "assistant",
        };
        let content = turn
            .blocks()
            .iter()
            .filter_map(wire_content)
            .collect::<Vec<_>>();
        if content.is_empty() {
            continue;
        }

        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(content),
            _ => messages.push(WireMessage { role, content }),
        }
    }

    messages
}

fn wire_content(block: &ContentBlock) -> Option<WireContent> {
    match block {
        ContentBlock::Text { text } if text.trim().is_empty() => None,
        ContentBlock::Text { text } => Some(WireContent::Text { text: text.clone() }),
        // Thinking blocks are only accepted back with the signature the API issued.
        ContentBlock::Reasoning { text, signature } => {
            signature.as_ref().map(|signature| WireContent::Thinking {
                thinking: text.clone(),
                signature: signature.clone(),
            })
        }
        ContentBlock::ToolInvocation {
            id,
            name,
            arguments,
        } => Some(WireContent::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: arguments.clone(),
        }),
        ContentBlock::ToolResult {
            invocation_id,
            output,
            is_error,
        } => Some(WireContent::ToolResult {
            tool_use_id: invocation_id.clone(),
            content: output.clone(),
            is_error: *is_error,
        }),
    }
}

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

struct DecodeState {
    sse: SseStream,
    decoder: SseDecoder,
    pending: VecDeque<LlmResult<ChannelEvent>>,
    http: HttpClient,
    finished: bool,
}

fn decode_response(http: HttpClient, response: Response) -> EventStream {
    let state = DecodeState {
        sse: Box::pin(response.bytes_stream().eventsource()),
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        http,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.sse.next().await {
                Some(Ok(event)) => {
                    state.http.log_stream_event(&event.event, &event.data);
                    match state.decoder.decode(&event.event, &event.data) {
                        Ok(events) => {
                            state.finished = state.decoder.is_complete();
                            state.pending.extend(events.into_iter().map(Ok));
                        }
                        Err(err) => {
                            state.finished = true;
                            state.pending.push_back(Err(err));
                        }
                    }
                }
                Some(Err(err)) => {
                    state.http.log_error(&err.to_string());
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(LlmError::Transport(err.to_string())));
                }
                None => {
                    state.finished = true;
                    if !state.decoder.is_complete() {
                        state.pending.push_back(Err(LlmError::Stream(
                            "stream closed before message_stop".to_string(),
                        )));
                    }
                }
            }
        }
    }))
}

/// Turns Anthropic SSE events into channel events, tracking which content-block index
/// belongs to which tool invocation.
#[derive(Debug, Default)]
struct SseDecoder {
    tool_blocks: HashMap<u32, String>,
    stop_reason: Option<StopReason>,
    complete: bool,
}

impl SseDecoder {
    fn is_complete(&self) -> bool {
        self.complete
    }

    fn decode(&mut self, event: &str, data: &str) -> LlmResult<Vec<ChannelEvent>> {
        match event {
            "content_block_start" => {
                let start: ContentBlockStart = parse(event, data)?;
                Ok(self.on_block_start(start))
            }
            "content_block_delta" => {
                let delta: ContentBlockDelta = parse(event, data)?;
                self.on_block_delta(delta)
            }
            "content_block_stop" => {
                let stop: ContentBlockStop = parse(event, data)?;
                Ok(self
                    .tool_blocks
                    .remove(&stop.index)
                    .map(|id| ChannelEvent::ToolInvocationEnd { id })
                    .into_iter()
                    .collect())
            }
            "message_delta" => {
                let delta: MessageDelta = parse(event, data)?;
                if let Some(reason) = delta.delta.stop_reason {
                    self.stop_reason = Some(StopReason::from_wire(&reason));
                }
                Ok(Vec::new())
            }
            "message_stop" => {
                self.complete = true;
                let stop_reason = self.stop_reason.take().unwrap_or(StopReason::EndTurn);
                Ok(vec![ChannelEvent::TurnEnd { stop_reason }])
            }
            "error" => {
                let error: SseError = parse(event, data)?;
                Err(LlmError::Stream(format!(
                    "{}: {}",
                    error.error.kind, error.error.message
                )))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn on_block_start(&mut self, start: ContentBlockStart) -> Vec<ChannelEvent> {
        match start.content_block {
            StartBlock::Text { text } if !text.is_empty() => {
                vec![ChannelEvent::TextDelta { text }]
            }
            StartBlock::Thinking { thinking } if !thinking.is_empty() => {
                vec![ChannelEvent::ReasoningDelta { text: thinking }]
            }
            StartBlock::ToolUse { id, name } => {
                self.tool_blocks.insert(start.index, id.clone());
                vec![ChannelEvent::ToolInvocationStart { id, name }]
            }
            _ => Vec::new(),
        }
    }

    fn on_block_delta(&mut self, delta: ContentBlockDelta) -> LlmResult<Vec<ChannelEvent>> {
        let event = match delta.delta {
            BlockDelta::TextDelta { text } => ChannelEvent::TextDelta { text },
            BlockDelta::ThinkingDelta { thinking } => ChannelEvent::ReasoningDelta { text: thinking },
            BlockDelta::SignatureDelta { signature } => {
                ChannelEvent::ReasoningSignature { signature }
            }
            BlockDelta::InputJsonDelta { partial_json } => {
                let id = self.tool_blocks.get(&delta.index).ok_or_else(|| {
                    LlmError::Stream(format!(
                        "tool arguments for content block {} without a tool_use start",
                        delta.index
                    ))
                })?;
                ChannelEvent::ToolInvocationArgumentDelta {
                    id: id.clone(),
                    partial_json,
                }
            }
            BlockDelta::Other => return Ok(Vec::new()),
        };
        Ok(vec![event])
    }
}

fn parse<'a, T: Deserialize<'a>>(event: &str, data: &'a str) -> LlmResult<T> {
    serde_json::from_str(data).map_err(|err| LlmError::Parse(format!("{event}: {err}")))
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<WireThinking>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: Value,
}

impl From<&ToolDeclaration> for WireTool {
    fn from(tool: &ToolDeclaration) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireThinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: u32,
    content_block: StartBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: u32,
    delta: BlockDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: u32,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: SseErrorBody,
}

#[derive(Debug, Deserialize)]
struct SseErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::{AnthropicChannel, SseDecoder, wire_messages};
    use crate::agent::history::{ContentBlock, Turn};
    use crate::http::client::HttpClient;
    use crate::http::debug::HttpDebugConfig;
    use crate::llm::provider::{
        ChannelEvent, ChannelRequest, LlmError, ModelChannel, StopReason, ToolDeclaration,
    };
    use futures::StreamExt;
    use reqwest::Client;
    use serde_json::{Value, json};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> HttpClient {
        HttpClient::new(Client::new(), HttpDebugConfig::disabled())
    }

    fn channel(base_url: String) -> AnthropicChannel {
        AnthropicChannel::new(
            http(),
            Some("test-key".to_string()),
            "test-model".to_string(),
            base_url,
        )
        .expect("channel")
    }

    fn sse_body(events: &[Value]) -> String {
        events
            .iter()
            .map(|data| {
                let name = data["type"].as_str().expect("event type");
                format!("event: {name}\ndata: {data}\n\n")
            })
            .collect()
    }

    fn request(history: Vec<Turn>) -> ChannelRequest {
        ChannelRequest {
            system: Some("system prompt".to_string()),
            history,
            tools: vec![ToolDeclaration {
                name: "execute".to_string(),
                description: "run code".to_string(),
                input_schema: json!({"type":"object"}),
            }],
            max_tokens: 2048,
            thinking_budget: None,
        }
    }

    #[test]
    fn wire_messages_merge_tool_results_with_following_user_text() {
        let history = vec![
            Turn::user("compute"),
            Turn::assistant(vec![
                ContentBlock::Reasoning {
                    text: "unsigned".to_string(),
                    signature: None,
                },
                ContentBlock::Text {
                    text: " ".to_string(),
                },
                ContentBlock::ToolInvocation {
                    id: "toolu_1".to_string(),
                    name: "execute".to_string(),
                    arguments: json!({"code":"1+1"}),
                },
            ]),
            Turn::tool_results(vec![ContentBlock::ToolResult {
                invocation_id: "toolu_1".to_string(),
                output: "[stdout]:\n2".to_string(),
                is_error: false,
            }]),
            Turn::user("thanks"),
        ];

        let wire = serde_json::to_value(wire_messages(&history)).expect("serialize");
        assert_eq!(
            wire,
            json!([
                {"role":"user","content":[{"type":"text","text":"compute"}]},
                {"role":"assistant","content":[
                    {"type":"tool_use","id":"toolu_1","name":"execute","input":{"code":"1+1"}}
                ]},
                {"role":"user","content":[
                    {"type":"tool_result","tool_use_id":"toolu_1","content":"[stdout]:\n2"},
                    {"type":"text","text":"thanks"}
                ]}
            ])
        );
    }

    #[test]
    fn wire_messages_replay_signed_reasoning_and_error_flag() {
        let history = vec![
            Turn::user("go"),
            Turn::assistant(vec![
                ContentBlock::Reasoning {
                    text: "think".to_string(),
                    signature: Some("sig".to_string()),
                },
                ContentBlock::ToolInvocation {
                    id: "t".to_string(),
                    name: "execute".to_string(),
                    arguments: json!({}),
                },
            ]),
            Turn::tool_results(vec![ContentBlock::ToolResult {
                invocation_id: "t".to_string(),
                output: "boom".to_string(),
                is_error: true,
            }]),
        ];

        let wire = serde_json::to_value(wire_messages(&history)).expect("serialize");
        assert_eq!(
            wire[1]["content"][0],
            json!({"type":"thinking","thinking":"think","signature":"sig"})
        );
        assert_eq!(wire[2]["content"][0]["is_error"], json!(true));
    }

    #[test]
    fn build_request_includes_thinking_only_when_budgeted() {
        let channel = channel("https://api.anthropic.com/".to_string());
        let mut req = request(vec![Turn::user("hi")]);

        let plain = serde_json::to_value(channel.build_request(&req)).expect("serialize");
        assert!(plain.get("thinking").is_none());
        assert_eq!(plain["stream"], json!(true));
        assert_eq!(plain["system"], json!("system prompt"));
        assert_eq!(plain["tools"][0]["name"], json!("execute"));

        req.thinking_budget = Some(1024);
        let thinking = serde_json::to_value(channel.build_request(&req)).expect("serialize");
        assert_eq!(
            thinking["thinking"],
            json!({"type":"enabled","budget_tokens":1024})
        );
        assert_eq!(channel.endpoint(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn decoder_maps_blocks_to_channel_events() {
        let mut decoder = SseDecoder::default();
        let mut events = Vec::new();
        let script = [
            json!({"type":"message_start","message":{"id":"msg_1"}}),
            json!({"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Let me run it."}}),
            json!({"type":"content_block_stop","index":1}),
            json!({"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"toolu_9","name":"execute","input":{}}}),
            json!({"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"code\":"}}),
            json!({"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"\"1\"}"}}),
            json!({"type":"content_block_stop","index":2}),
            json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":5}}),
            json!({"type":"ping"}),
            json!({"type":"message_stop"}),
        ];

        for data in script {
            let name = data["type"].as_str().expect("type").to_string();
            events.extend(decoder.decode(&name, &data.to_string()).expect("decode"));
        }

        assert!(decoder.is_complete());
        assert_eq!(
            events,
            vec![
                ChannelEvent::ReasoningDelta {
                    text: "hmm".to_string()
                },
                ChannelEvent::ReasoningSignature {
                    signature: "sig".to_string()
                },
                ChannelEvent::TextDelta {
                    text: "Let me run it.".to_string()
                },
                ChannelEvent::ToolInvocationStart {
                    id: "toolu_9".to_string(),
                    name: "execute".to_string()
                },
                ChannelEvent::ToolInvocationArgumentDelta {
                    id: "toolu_9".to_string(),
                    partial_json: "{\"code\":".to_string()
                },
                ChannelEvent::ToolInvocationArgumentDelta {
                    id: "toolu_9".to_string(),
                    partial_json: "\"1\"}".to_string()
                },
                ChannelEvent::ToolInvocationEnd {
                    id: "toolu_9".to_string()
                },
                ChannelEvent::TurnEnd {
                    stop_reason: StopReason::ToolUse
                },
            ]
        );
    }

    #[test]
    fn decoder_rejects_arguments_for_unknown_block() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .decode(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":3,"delta":{"type":"input_json_delta","partial_json":"{}"}}"#,
            )
            .expect_err("orphan delta");
        assert!(matches!(err, LlmError::Stream(_)));
    }

    #[test]
    fn decoder_surfaces_error_events_and_bad_json() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .decode(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .expect_err("error event");
        assert_eq!(
            err,
            LlmError::Stream("overloaded_error: Overloaded".to_string())
        );

        let err = decoder
            .decode("content_block_start", "{not json")
            .expect_err("bad json");
        assert!(matches!(err, LlmError::Parse(msg) if msg.starts_with("content_block_start:")));
    }

    #[test]
    fn decoder_defaults_stop_reason_to_end_turn() {
        let mut decoder = SseDecoder::default();
        let events = decoder
            .decode("message_stop", r#"{"type":"message_stop"}"#)
            .expect("decode");
        assert_eq!(
            events,
            vec![ChannelEvent::TurnEnd {
                stop_reason: StopReason::EndTurn
            }]
        );
    }

    #[tokio::test]
    async fn stream_posts_messages_request_and_yields_events() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"type":"message_start","message":{"id":"msg_1"}}),
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}),
            json!({"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello"}}),
            json!({"type":"content_block_stop","index":0}),
            json!({"type":"message_delta","delta":{"stop_reason":"end_turn"}}),
            json!({"type":"message_stop"}),
        ]);

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_string_contains("\"stream\":true"))
            .and(body_string_contains("\"model\":\"test-model\""))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let stream = channel(server.uri())
            .stream(request(vec![Turn::user("hi")]))
            .await
            .expect("stream");
        let events = stream.collect::<Vec<_>>().await;

        assert_eq!(
            events,
            vec![
                Ok(ChannelEvent::TextDelta {
                    text: "hello".to_string()
                }),
                Ok(ChannelEvent::TurnEnd {
                    stop_reason: StopReason::EndTurn
                }),
            ]
        );
    }

    #[tokio::test]
    async fn stream_reports_truncated_response() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"type":"message_start","message":{"id":"msg_1"}}),
            json!({"type":"content_block_start","index":0,"content_block":{"type":"text","text":"par"}}),
        ]);

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let events = channel(server.uri())
            .stream(request(vec![Turn::user("hi")]))
            .await
            .expect("stream")
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            Ok(ChannelEvent::TextDelta {
                text: "par".to_string()
            })
        );
        assert!(matches!(&events[1], Err(LlmError::Stream(msg)) if msg.contains("message_stop")));
    }

    #[tokio::test]
    async fn stream_maps_http_error_status() {
        let server = MockServer::start().await;
        let long_body = format!("invalid x-api-key {}", "x".repeat(1_000));

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string(long_body))
            .mount(&server)
            .await;

        let err = match channel(server.uri())
            .stream(request(vec![Turn::user("hi")]))
            .await
        {
            Ok(_) => panic!("expected auth error"),
            Err(err) => err,
        };

        match err {
            LlmError::HttpStatus { status, body } => {
                assert_eq!(status, 401);
                assert!(body.starts_with("invalid x-api-key"));
                assert_eq!(body.chars().count(), 400);
            }
            other => panic!("expected HttpStatus, got {other:?}"),
        }
    }

    #[test]
    fn new_requires_api_key() {
        for key in [None, Some("  ".to_string())] {
            let err = AnthropicChannel::new(
                http(),
                key,
                "test-model".to_string(),
                "https://example.com".to_string(),
            )
            .expect_err("missing key should fail");
            assert_eq!(err, LlmError::MissingApiKey);
        }
    }
}
