use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::llm::WireFormat;

/// How a decode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Body exhausted or `[DONE]` seen.
    Completed,
    Cancelled,
}

/// Incremental decoder for SSE (`data: {...}`) and NDJSON bodies.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence or a JSON
/// frame; the decoder keeps the partial tail until the next chunk arrives.
#[derive(Debug)]
pub struct StreamDecoder {
    format: WireFormat,
    pending_bytes: Vec<u8>,
    buffer: String,
    done: bool,
}

impl StreamDecoder {
    pub fn new(format: WireFormat) -> Self {
        StreamDecoder {
            format,
            pending_bytes: Vec::new(),
            buffer: String::new(),
            done: false,
        }
    }

    /// True once a `[DONE]` sentinel was seen; later input is ignored.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one chunk and returns the text deltas of every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.decode_utf8(chunk);
        let mut deltas = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(delta) = self.process_line(&line) {
                deltas.push(delta);
            }
            if self.done {
                self.buffer.clear();
                self.pending_bytes.clear();
                break;
            }
        }
        deltas
    }

    /// Flushes a trailing frame that arrived without a newline.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending_bytes.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.buffer.push_str(&rest);
            self.pending_bytes.clear();
        }
        let residual = std::mem::take(&mut self.buffer);
        if self.done {
            return None;
        }
        let trimmed = residual.trim();
        let payload = trimmed
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(trimmed);
        if looks_like_object(payload) {
            self.parse_frame(payload)
        } else {
            None
        }
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending_bytes.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending_bytes);
        match std::str::from_utf8(&bytes) {
            Ok(text) => self.buffer.push_str(text),
            Err(err) => {
                let valid = err.valid_up_to();
                // valid_up_to() always lands on a char boundary
                self.buffer
                    .push_str(std::str::from_utf8(&bytes[..valid]).unwrap_or_default());
                match err.error_len() {
                    None => self.pending_bytes = bytes[valid..].to_vec(),
                    Some(_) => {
                        self.buffer
                            .push_str(&String::from_utf8_lossy(&bytes[valid..]));
                    }
                }
            }
        }
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(payload) = trimmed.strip_prefix("data:") {
            let payload = payload.trim_start();
            if payload == "[DONE]" {
                self.done = true;
                return None;
            }
            return self.parse_frame(payload);
        }
        if looks_like_object(trimmed) {
            return self.parse_frame(trimmed);
        }
        None
    }

    fn parse_frame(&self, payload: &str) -> Option<String> {
        match serde_json::from_str::<Value>(payload) {
            Ok(frame) => extract_delta(&frame, self.format),
            Err(err) => {
                tracing::trace!(%err, "skipping malformed stream frame");
                None
            }
        }
    }
}

fn looks_like_object(text: &str) -> bool {
    text.starts_with('{') && text.ends_with('}')
}

/// Pulls the text delta out of a response frame, trying every known shape.
pub fn extract_delta(frame: &Value, format: WireFormat) -> Option<String> {
    match format {
        WireFormat::Ollama => string_at(frame, &["response"])
            .or_else(|| string_at(frame, &["message", "content"]))
            .or_else(|| string_at(frame, &["content"])),
        WireFormat::OpenAi => {
            extract_choice_delta(frame).or_else(|| top_level_text(frame))
        }
    }
}

fn extract_choice_delta(frame: &Value) -> Option<String> {
    let choice = frame.get("choices")?.as_array()?.first()?;
    let delta = choice.get("delta").unwrap_or(choice);
    let named = string_at(delta, &["content"])
        .or_else(|| string_at(delta, &["text"]))
        .or_else(|| string_at(choice, &["text"]))
        .or_else(|| string_at(delta, &["message", "content"]))
        .or_else(|| string_at(choice, &["message", "content"]))
        .or_else(|| string_at(delta, &["message"]))
        .or_else(|| string_at(delta, &["response"]))
        .or_else(|| string_at(delta, &["data"]))
        .or_else(|| string_at(delta, &["output"]));
    if named.is_some() {
        return named;
    }
    delta.as_object()?.iter().find_map(|(key, value)| {
        if key == "role" || key == "finish_reason" {
            return None;
        }
        value.as_str().map(str::to_string)
    })
}

fn top_level_text(frame: &Value) -> Option<String> {
    string_at(frame, &["content"])
        .or_else(|| string_at(frame, &["text"]))
        .or_else(|| string_at(frame, &["response"]))
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().map(str::to_string)
}

/// Drives `body` through a [`StreamDecoder`], handing each delta to `on_delta`
/// as soon as its line is complete.
pub async fn decode_body<S, B, E>(
    body: S,
    format: WireFormat,
    token: &CancellationToken,
    on_delta: &mut (dyn FnMut(&str) + Send),
) -> Result<StreamEnd, ChatError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
{
    let mut body = body;
    let mut decoder = StreamDecoder::new(format);
    let mut frames = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(frames, "stream cancelled");
                return Ok(StreamEnd::Cancelled);
            }
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(Into::into)?;
        for delta in decoder.push(chunk.as_ref()) {
            frames += 1;
            on_delta(&delta);
        }
        if decoder.is_done() {
            break;
        }
    }
    if token.is_cancelled() {
        return Ok(StreamEnd::Cancelled);
    }
    if let Some(delta) = decoder.finish() {
        frames += 1;
        on_delta(&delta);
    }
    tracing::debug!(frames, "stream completed");
    Ok(StreamEnd::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;

    fn decode_all(format: WireFormat, chunks: &[&[u8]]) -> String {
        let mut decoder = StreamDecoder::new(format);
        let mut out = String::new();
        for chunk in chunks {
            for delta in decoder.push(chunk) {
                out.push_str(&delta);
            }
        }
        if let Some(delta) = decoder.finish() {
            out.push_str(&delta);
        }
        out
    }

    const OPENAI_STREAM: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"上证\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"指数 \"}}]}\r\n",
        ": keep-alive\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"up\\\": 1}\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
        "data: [DONE]\n",
    );

    #[test]
    fn openai_happy_path() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: [DONE]\n",
        );
        assert_eq!(decode_all(WireFormat::OpenAi, &[body.as_bytes()]), "Hello");
    }

    #[test]
    fn result_is_independent_of_chunk_boundaries() {
        let bytes = OPENAI_STREAM.as_bytes();
        let expected = decode_all(WireFormat::OpenAi, &[bytes]);
        assert_eq!(expected, "上证指数 {\"up\": 1}");
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(
                decode_all(WireFormat::OpenAi, &[head, tail]),
                expected,
                "split at {split}"
            );
        }
        let single_bytes: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(WireFormat::OpenAi, &single_bytes), expected);
        let odd: Vec<&[u8]> = bytes.chunks(7).collect();
        assert_eq!(decode_all(WireFormat::OpenAi, &odd), expected);
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let body = concat!(
            "data: {not valid json\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
        );
        assert_eq!(decode_all(WireFormat::OpenAi, &[body.as_bytes()]), "ok");
    }

    #[test]
    fn done_stops_the_stream() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        let mut decoder = StreamDecoder::new(WireFormat::OpenAi);
        assert_eq!(decoder.push(body.as_bytes()), vec!["a".to_string()]);
        assert!(decoder.is_done());
        assert!(decoder.push(b"data: {\"text\":\"c\"}\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn ollama_ndjson_with_trailing_frame_without_newline() {
        let body = concat!(
            "{\"model\":\"qwen\",\"response\":\"Market \",\"done\":false}\n",
            "{\"model\":\"qwen\",\"message\":{\"role\":\"assistant\",\"content\":\"is \"}}\n",
            "{\"response\":\"up.\",\"done\":true}",
        );
        assert_eq!(
            decode_all(WireFormat::Ollama, &[body.as_bytes()]),
            "Market is up."
        );
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"涨停板\"}}]}\n".as_bytes();
        let pivot = body.iter().position(|b| *b >= 0x80).expect("multibyte") + 1;
        let (head, tail) = body.split_at(pivot);
        assert_eq!(decode_all(WireFormat::OpenAi, &[head, tail]), "涨停板");
    }

    #[test]
    fn openai_field_fallbacks() {
        let cases = [
            (json!({"choices":[{"delta":{"text":"t"}}]}), "t"),
            (json!({"choices":[{"text":"legacy"}]}), "legacy"),
            (json!({"choices":[{"message":{"content":"full"}}]}), "full"),
            (json!({"choices":[{"delta":{"message":"plain"}}]}), "plain"),
            (json!({"choices":[{"delta":{"response":"r"}}]}), "r"),
            (json!({"choices":[{"delta":{"output":"o"}}]}), "o"),
            (
                json!({"choices":[{"delta":{"role":"assistant","reasoning_content":"think"}}]}),
                "think",
            ),
            (json!({"content":"top"}), "top"),
            (json!({"response":"resp"}), "resp"),
        ];
        for (frame, expected) in cases {
            assert_eq!(
                extract_delta(&frame, WireFormat::OpenAi).as_deref(),
                Some(expected),
                "{frame}"
            );
        }
        let role_only = json!({"choices":[{"delta":{"role":"assistant"},"finish_reason":null}]});
        assert_eq!(extract_delta(&role_only, WireFormat::OpenAi), None);
    }

    #[test]
    fn ollama_ignores_openai_shapes() {
        let frame = json!({"choices":[{"delta":{"content":"x"}}]});
        assert_eq!(extract_delta(&frame, WireFormat::Ollama), None);
        let frame = json!({"content":"c"});
        assert_eq!(extract_delta(&frame, WireFormat::Ollama).as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn decode_body_forwards_deltas_in_order() {
        let chunks: Vec<Result<&'static [u8], ChatError>> = vec![
            Ok(&b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\ndata: {\"cho"[..]),
            Ok(&b"ices\":[{\"delta\":{\"content\":\"B\"}}]}\n"[..]),
            Ok(&b"data: [DONE]\n"[..]),
        ];
        let token = CancellationToken::new();
        let mut seen = Vec::new();
        let end = decode_body(
            stream::iter(chunks),
            WireFormat::OpenAi,
            &token,
            &mut |delta: &str| seen.push(delta.to_string()),
        )
        .await
        .unwrap();
        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(seen, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn decode_body_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let chunks: Vec<Result<&'static [u8], ChatError>> =
            vec![Ok(&b"{\"response\":\"x\"}\n"[..])];
        let mut seen = String::new();
        let end = decode_body(
            stream::iter(chunks),
            WireFormat::Ollama,
            &token,
            &mut |delta: &str| seen.push_str(delta),
        )
        .await
        .unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert!(seen.is_empty());
    }
}
