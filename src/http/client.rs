use super::debug::{HttpDebugConfig, redact_header_value, redact_text_body, truncate_for_log};
use crate::trace::SessionTrace;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::Serialize;
use std::fmt;
use std::io::{self, Write};
#[cfg(test)]
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct HttpClient {
    inner: Client,
    debug: HttpDebugConfig,
    sink: LogSink,
    trace: Option<SessionTrace>,
}

#[derive(Clone)]
enum LogSink {
    Stderr,
    #[cfg(test)]
    Buffer(Arc<Mutex<Vec<String>>>),
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("debug", &self.debug)
            .finish()
    }
}

impl HttpClient {
    pub fn new(inner: Client, debug: HttpDebugConfig) -> Self {
        Self {
            inner,
            debug,
            sink: LogSink::Stderr,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: SessionTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Sends a JSON POST and hands back the response with its body still unread, so the
    /// caller can consume it as a stream.
    pub async fn post_json_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        payload: &T,
    ) -> Result<Response, reqwest::Error> {
        let body_json = serde_json::to_string(payload)
            .unwrap_or_else(|err| format!("{{\"_serialization_error\":\"{err}\"}}"));

        let mut builder = self.inner.post(url).json(payload);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.build()?;

        self.log_lines(request_log_lines(self.debug, &request, &body_json));
        if let Some(trace) = &self.trace {
            trace.log_http_request(
                request.method().as_str(),
                request.url().as_str(),
                &redacted_headers(request.headers()),
                &body_json,
            );
        }

        let response = match self.inner.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                self.log_error(&err.to_string());
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        self.log_lines(response_head_log_lines(status, response.headers(), self.debug));
        if let Some(trace) = &self.trace {
            trace.log_http_response_head(status, &redacted_headers(response.headers()));
        }

        Ok(response)
    }

    pub fn log_stream_event(&self, event: &str, data: &str) {
        self.log_lines(stream_event_log_lines(self.debug, event, data));
        if let Some(trace) = &self.trace {
            trace.log_http_stream_event(event, data);
        }
    }

    pub fn log_response_body(&self, body: &str) {
        let body = redact_text_body(body, self.debug.redact_secrets);
        let body = truncate_for_log(&body, self.debug.max_body_chars);
        let mut lines = Vec::new();
        append_body_lines(&mut lines, '<', &body);
        self.log_lines(lines);
        if let Some(trace) = &self.trace {
            trace.log_http_response_body(&body);
        }
    }

    pub fn log_error(&self, message: &str) {
        self.log_lines(vec![format!("[http-debug] ! {message}")]);
        if let Some(trace) = &self.trace {
            trace.log_http_error(message);
        }
    }

    fn log_lines(&self, lines: Vec<String>) {
        if !self.debug.enabled {
            return;
        }

        for line in lines {
            self.log_line(line);
        }
    }

    fn log_line(&self, line: String) {
        match &self.sink {
            LogSink::Stderr => {
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{line}");
            }
            #[cfg(test)]
            LogSink::Buffer(buffer) => {
                if let Ok(mut b) = buffer.lock() {
                    b.push(line);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn with_buffer_sink(
        inner: Client,
        debug: HttpDebugConfig,
    ) -> (Self, Arc<Mutex<Vec<String>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let client = Self {
            inner,
            debug,
            sink: LogSink::Buffer(Arc::clone(&buffer)),
            trace: None,
        };
        (client, buffer)
    }
}

fn redacted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                redact_header_value(name.as_str(), value, true),
            )
        })
        .collect()
}

fn request_log_lines(
    debug: HttpDebugConfig,
    request: &reqwest::Request,
    body_json: &str,
) -> Vec<String> {
    let body = redact_text_body(body_json, debug.redact_secrets);
    let body = truncate_for_log(&body, debug.max_body_chars);

    let mut lines = Vec::new();
    lines.push(format!("[http-debug] > {} {}", request.method(), request.url()));
    for (name, value) in request.headers() {
        lines.push(format!(
            "[http-debug] > {}: {}",
            name.as_str(),
            redact_header_value(name.as_str(), value, debug.redact_secrets)
        ));
    }
    lines.push("[http-debug] >".to_string());
    append_body_lines(&mut lines, '>', &body);
    lines
}

fn response_head_log_lines(status: u16, headers: &HeaderMap, debug: HttpDebugConfig) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("[http-debug] < HTTP {status}"));
    for (name, value) in headers {
        lines.push(format!(
            "[http-debug] < {}: {}",
            name.as_str(),
            redact_header_value(name.as_str(), value, debug.redact_secrets)
        ));
    }
    lines.push("[http-debug] <".to_string());
    lines
}

fn stream_event_log_lines(debug: HttpDebugConfig, event: &str, data: &str) -> Vec<String> {
    let data = redact_text_body(data, debug.redact_secrets);
    let data = truncate_for_log(&data, debug.max_body_chars);
    vec![format!("[http-debug] < [{event}] {data}")]
}

fn append_body_lines(lines: &mut Vec<String>, direction: char, body: &str) {
    if body.is_empty() {
        lines.push(format!("[http-debug] {direction} <empty body>"));
        return;
    }

    for line in body.lines() {
        lines.push(format!("[http-debug] {direction} {line}"));
    }
}
