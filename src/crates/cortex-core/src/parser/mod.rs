//! Streaming protocol parser
//!
//! Incrementally converts an LLM token stream into typed protocol events and
//! fully parsed [`Action`]s. The parser is a push-only character-driven state
//! machine: it accepts arbitrary chunk boundaries (including split UTF-8
//! codepoints and tags split across chunks), never requests more input, and
//! recovers from malformed constructs without poisoning the outer stream.
//!
//! Recognized top-level constructs, in any order:
//!
//! ```text
//! <thought>...</thought>
//! <action type="tool" mode="async" id="f1" depends_on="a,b">{...}</action>
//! <response final="false">...</response>
//! <context_feed id="x">...</context_feed>
//! ```
//!
//! Thought and response text stream out as chunk events batched by the
//! configured flush size (a newline always flushes). Action JSON bodies are
//! buffered in full and parsed on the closing tag; tolerated generator
//! defects (comments, trailing commas) are stripped by [`json`] first.
//! Unknown top-level tags warn and are skipped; bare top-level text is
//! absorbed silently; a nested `<action>` inside an action body raises a
//! protocol error but is treated as literal text.

pub mod json;

use crate::action::{Action, ActionKind, ActionMode, RetryPolicy};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const THOUGHT_CLOSE: &str = "</thought>";
const RESPONSE_CLOSE: &str = "</response>";
const ACTION_CLOSE: &str = "</action>";
const CONTEXT_FEED_CLOSE: &str = "</context_feed>";

/// Longest a `<...` candidate may grow without a `>` before the `<` is
/// demoted to literal text.
const MAX_TAG_SCAN: usize = 512;

/// How much of a dropped action body is quoted in warning events.
const BODY_PREVIEW_CHARS: usize = 200;

/// Public state of the parser's finite state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    InThought,
    /// An `<action ...` open tag is buffered but its `>` has not arrived
    InActionOpenTag,
    InActionBody,
    InResponse,
    InContextFeed,
}

/// Events produced by the parser, before sequence/correlation annotation
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    ThoughtStart,
    ThoughtChunk { text: String },
    ThoughtEnd,
    ResponseStart { is_final: bool },
    ResponseChunk { text: String },
    /// Raw accumulated response text; `$name` substitution happens in the
    /// controller before the outward `response_end` is emitted
    ResponseEnd { raw_text: String, is_final: bool },
    ActionParsed {
        action_id: String,
        kind: ActionKind,
        mode: ActionMode,
        target: String,
    },
    ContextFeed { id: String, value: Value },
    Warning { code: String, message: String },
    ProtocolError { message: String },
}

/// Everything one `feed` call produced
#[derive(Debug, Default)]
pub struct ParseOutput {
    pub events: Vec<ParserEvent>,
    /// Actions ready for scheduling, in closing-tag order
    pub actions: Vec<Action>,
}

impl ParseOutput {
    /// Append another batch of parser output, preserving order.
    pub fn merge(&mut self, mut other: ParseOutput) {
        self.events.append(&mut other.events);
        self.actions.append(&mut other.actions);
    }
}

/// JSON body of an `<action>` element
#[derive(Debug, Deserialize)]
struct ActionBody {
    name: String,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    output_key: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    skip_on_error: bool,
}

/// Accumulator for the `<action>` element currently being buffered
#[derive(Debug)]
struct PendingAction {
    id: Option<String>,
    kind: Option<ActionKind>,
    mode: ActionMode,
    depends_on: Vec<String>,
    metadata: BTreeMap<String, String>,
    /// Set when the open tag was unusable; the element is consumed and
    /// dropped with this reason
    invalid_reason: Option<String>,
    body: String,
}

/// Push-only incremental parser for the agent response protocol
pub struct StreamParser {
    state: ParserState,
    /// Unconsumed input, including holdbacks for tags split across chunks
    buf: String,
    /// Incomplete UTF-8 tail from `feed_bytes`
    utf8_partial: Vec<u8>,

    flush_chars: usize,
    /// Batched thought/response text not yet emitted as a chunk
    text_pending: String,
    text_pending_chars: usize,

    /// Full response accumulation (chunks are batched separately)
    response_text: String,
    response_is_final: bool,
    /// The first `<response>` of an iteration wins; later ones are consumed
    /// but ignored
    response_seen: bool,
    response_ignored: bool,

    action: Option<PendingAction>,
    /// Closing-tag ordinal, used for `action_<n>` auto-ids
    action_ordinal: usize,

    feed_id: Option<String>,
    feed_body: String,
}

impl StreamParser {
    pub fn new(flush_chars: usize) -> Self {
        Self {
            state: ParserState::Idle,
            buf: String::new(),
            utf8_partial: Vec::new(),
            flush_chars: flush_chars.max(1),
            text_pending: String::new(),
            text_pending_chars: 0,
            response_text: String::new(),
            response_is_final: true,
            response_seen: false,
            response_ignored: false,
            action: None,
            action_ordinal: 0,
            feed_id: None,
            feed_body: String::new(),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Feed raw bytes, reassembling codepoints split across chunk
    /// boundaries.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> ParseOutput {
        let mut output = ParseOutput::default();
        self.utf8_partial.extend_from_slice(bytes);

        loop {
            match std::str::from_utf8(&self.utf8_partial) {
                Ok(s) => {
                    let chunk = s.to_string();
                    self.utf8_partial.clear();
                    output.merge(self.feed(&chunk));
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if valid > 0 {
                        let chunk =
                            String::from_utf8(self.utf8_partial[..valid].to_vec())
                                .unwrap_or_default();
                        output.merge(self.feed(&chunk));
                    }
                    match e.error_len() {
                        // Incomplete trailing sequence: keep for the next
                        // chunk.
                        None => {
                            self.utf8_partial.drain(..valid);
                            break;
                        }
                        // Invalid bytes: replace and move on.
                        Some(len) => {
                            self.utf8_partial.drain(..valid + len);
                            output.merge(self.feed("\u{FFFD}"));
                        }
                    }
                }
            }
        }

        output
    }

    /// Feed a complete UTF-8 chunk.
    pub fn feed(&mut self, chunk: &str) -> ParseOutput {
        self.buf.push_str(chunk);
        let mut output = ParseOutput::default();
        self.process(&mut output);
        output
    }

    /// Signal end of stream: flushes residual text and reports unclosed
    /// constructs.
    pub fn finish(&mut self) -> ParseOutput {
        let mut output = ParseOutput::default();
        // Whatever is still buffered can no longer become a tag.
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            match self.state {
                ParserState::InThought | ParserState::InResponse => self.push_text(&rest, &mut output),
                ParserState::InActionBody => {
                    if let Some(action) = self.action.as_mut() {
                        action.body.push_str(&rest);
                    }
                }
                ParserState::InContextFeed => self.feed_body.push_str(&rest),
                ParserState::Idle | ParserState::InActionOpenTag => {}
            }
        }

        match self.state {
            ParserState::Idle | ParserState::InActionOpenTag => {}
            ParserState::InThought => {
                output.events.push(ParserEvent::Warning {
                    code: "unclosed_tag".to_string(),
                    message: "stream ended inside <thought>".to_string(),
                });
                self.flush_text_chunk(&mut output);
                output.events.push(ParserEvent::ThoughtEnd);
            }
            ParserState::InResponse => {
                // Truncated generations still deliver what they produced.
                output.events.push(ParserEvent::Warning {
                    code: "unclosed_tag".to_string(),
                    message: "stream ended inside <response>".to_string(),
                });
                self.end_response(&mut output);
            }
            ParserState::InActionBody => {
                output.events.push(ParserEvent::Warning {
                    code: "unclosed_tag".to_string(),
                    message: "stream ended inside <action>; action dropped".to_string(),
                });
                self.action = None;
            }
            ParserState::InContextFeed => {
                output.events.push(ParserEvent::Warning {
                    code: "unclosed_tag".to_string(),
                    message: "stream ended inside <context_feed>; feed dropped".to_string(),
                });
                self.feed_id = None;
                self.feed_body.clear();
            }
        }

        self.state = ParserState::Idle;
        output
    }

    fn process(&mut self, output: &mut ParseOutput) {
        loop {
            let more = match self.state {
                ParserState::Idle | ParserState::InActionOpenTag => self.process_idle(output),
                ParserState::InThought => self.process_text(THOUGHT_CLOSE, output),
                ParserState::InResponse => self.process_text(RESPONSE_CLOSE, output),
                ParserState::InActionBody => self.process_action_body(output),
                ParserState::InContextFeed => self.process_feed_body(output),
            };
            if !more {
                break;
            }
        }
    }

    /// Top level: absorb bare text, recognize open tags. Returns true when
    /// progress was made and processing should continue.
    fn process_idle(&mut self, output: &mut ParseOutput) -> bool {
        let Some(lt) = self.buf.find('<') else {
            // Bare top-level text is absorbed silently.
            self.buf.clear();
            return false;
        };
        if lt > 0 {
            self.buf.drain(..lt);
        }

        // Not a plausible tag: demote the '<' to absorbed text.
        if let Some(next) = self.buf[1..].chars().next() {
            if !(next.is_ascii_alphabetic() || next == '/') {
                self.buf.drain(..1);
                return true;
            }
        } else {
            return false;
        }

        let Some(gt) = self.buf.find('>') else {
            if self.buf.len() > MAX_TAG_SCAN {
                self.buf.drain(..1);
                return true;
            }
            self.state = if self.buf.starts_with("<action") {
                ParserState::InActionOpenTag
            } else {
                ParserState::Idle
            };
            return false;
        };

        let tag: String = self.buf[1..gt].to_string();
        self.buf.drain(..=gt);
        self.handle_tag(&tag, output);
        true
    }

    fn handle_tag(&mut self, tag: &str, output: &mut ParseOutput) {
        if let Some(rest) = tag.strip_prefix('/') {
            // Stray closing tags at the top level are absorbed.
            debug!(tag = rest, "ignoring stray closing tag at top level");
            self.state = ParserState::Idle;
            return;
        }

        let (name, attr_src) = match tag.find(char::is_whitespace) {
            Some(pos) => (&tag[..pos], &tag[pos..]),
            None => (tag, ""),
        };
        let attrs = parse_attributes(attr_src);

        match name {
            "thought" => {
                self.state = ParserState::InThought;
                self.reset_text();
                output.events.push(ParserEvent::ThoughtStart);
            }
            "response" => {
                let is_final = match attrs.iter().find(|(k, _)| k == "final") {
                    None => true,
                    Some((_, v)) => v == "true",
                };
                if self.response_seen {
                    output.events.push(ParserEvent::Warning {
                        code: "duplicate_response".to_string(),
                        message: "a <response> was already parsed this iteration; ignoring"
                            .to_string(),
                    });
                    self.response_ignored = true;
                } else {
                    self.response_seen = true;
                    self.response_ignored = false;
                    self.response_is_final = is_final;
                    self.response_text.clear();
                    output.events.push(ParserEvent::ResponseStart { is_final });
                }
                self.state = ParserState::InResponse;
                self.reset_text();
            }
            "action" => {
                let mut pending = PendingAction {
                    id: None,
                    kind: None,
                    mode: ActionMode::default(),
                    depends_on: Vec::new(),
                    metadata: BTreeMap::new(),
                    invalid_reason: None,
                    body: String::new(),
                };
                for (key, value) in attrs {
                    match key.as_str() {
                        "type" => match ActionKind::parse(&value) {
                            Some(kind) => pending.kind = Some(kind),
                            None => {
                                pending.invalid_reason =
                                    Some(format!("unknown action type '{}'", value));
                            }
                        },
                        "mode" => match ActionMode::parse(&value) {
                            Some(mode) => pending.mode = mode,
                            None => {
                                pending.invalid_reason =
                                    Some(format!("unknown action mode '{}'", value));
                            }
                        },
                        "id" => pending.id = Some(value),
                        "depends_on" => {
                            pending.depends_on = value
                                .split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string)
                                .collect();
                        }
                        _ => {
                            pending.metadata.insert(key, value);
                        }
                    }
                }
                if pending.kind.is_none() && pending.invalid_reason.is_none() {
                    pending.invalid_reason = Some("missing 'type' attribute".to_string());
                }
                self.action = Some(pending);
                self.state = ParserState::InActionBody;
            }
            "context_feed" => {
                self.feed_id = attrs.into_iter().find(|(k, _)| k == "id").map(|(_, v)| v);
                if self.feed_id.is_none() {
                    output.events.push(ParserEvent::Warning {
                        code: "missing_attribute".to_string(),
                        message: "<context_feed> without id; feed dropped".to_string(),
                    });
                }
                self.feed_body.clear();
                self.state = ParserState::InContextFeed;
            }
            other => {
                output.events.push(ParserEvent::Warning {
                    code: "unknown_tag".to_string(),
                    message: format!("unknown top-level tag <{}>; skipped", other),
                });
                self.state = ParserState::Idle;
            }
        }
    }

    /// Stream text inside `<thought>`/`<response>` until the closing tag.
    fn process_text(&mut self, close: &str, output: &mut ParseOutput) -> bool {
        let mut scan_from = 0;
        loop {
            let Some(rel) = self.buf[scan_from..].find('<') else {
                let text = std::mem::take(&mut self.buf);
                self.push_text(&text, output);
                return false;
            };
            let lt = scan_from + rel;

            let rest = &self.buf[lt..];
            if rest.starts_with(close) {
                let text: String = self.buf[..lt].to_string();
                self.push_text(&text, output);
                self.buf.drain(..lt + close.len());
                match self.state {
                    ParserState::InThought => {
                        self.flush_text_chunk(output);
                        output.events.push(ParserEvent::ThoughtEnd);
                    }
                    _ => self.end_response(output),
                }
                self.state = ParserState::Idle;
                return true;
            }
            if close.starts_with(rest) {
                // Possible split closing tag: hold back from '<' and wait.
                let text: String = self.buf[..lt].to_string();
                self.push_text(&text, output);
                self.buf.drain(..lt);
                return false;
            }
            // Literal '<' inside text.
            scan_from = lt + 1;
        }
    }

    fn process_action_body(&mut self, output: &mut ParseOutput) -> bool {
        let mut scan_from = 0;
        loop {
            let Some(rel) = self.buf[scan_from..].find('<') else {
                let body = std::mem::take(&mut self.buf);
                if let Some(action) = self.action.as_mut() {
                    action.body.push_str(&body);
                }
                return false;
            };
            let lt = scan_from + rel;
            let rest = &self.buf[lt..];

            if rest.starts_with(ACTION_CLOSE) {
                let body: String = self.buf[..lt].to_string();
                self.buf.drain(..lt + ACTION_CLOSE.len());
                if let Some(action) = self.action.as_mut() {
                    action.body.push_str(&body);
                }
                self.finalize_action(output);
                self.state = ParserState::Idle;
                return true;
            }
            if ACTION_CLOSE.starts_with(rest) {
                let body: String = self.buf[..lt].to_string();
                if let Some(action) = self.action.as_mut() {
                    action.body.push_str(&body);
                }
                self.buf.drain(..lt);
                return false;
            }
            if rest.starts_with("<action") {
                // Nested <action> is a protocol violation; the inner
                // occurrence is literal text.
                output.events.push(ParserEvent::ProtocolError {
                    message: "nested <action> inside an action body".to_string(),
                });
                scan_from = lt + "<action".len();
                continue;
            }
            if "<action".starts_with(rest) {
                let body: String = self.buf[..lt].to_string();
                if let Some(action) = self.action.as_mut() {
                    action.body.push_str(&body);
                }
                self.buf.drain(..lt);
                return false;
            }
            scan_from = lt + 1;
        }
    }

    fn process_feed_body(&mut self, output: &mut ParseOutput) -> bool {
        let Some(pos) = self.buf.find(CONTEXT_FEED_CLOSE) else {
            // Hold back a potential split closing tag.
            let keep = held_back_len(&self.buf, CONTEXT_FEED_CLOSE);
            let take_len = self.buf.len() - keep;
            let body: String = self.buf[..take_len].to_string();
            self.buf.drain(..take_len);
            self.feed_body.push_str(&body);
            return false;
        };

        let body: String = self.buf[..pos].to_string();
        self.buf.drain(..pos + CONTEXT_FEED_CLOSE.len());
        self.feed_body.push_str(&body);
        self.finalize_feed(output);
        self.state = ParserState::Idle;
        true
    }

    fn finalize_action(&mut self, output: &mut ParseOutput) {
        let Some(pending) = self.action.take() else {
            return;
        };
        self.action_ordinal += 1;

        if let Some(reason) = pending.invalid_reason {
            warn!(reason = %reason, "dropping action with unusable open tag");
            output.events.push(ParserEvent::Warning {
                code: "invalid_action_tag".to_string(),
                message: format!("action dropped: {}", reason),
            });
            return;
        }

        let cleaned = json::strip_json_defects(&pending.body);
        let body: ActionBody = match serde_json::from_str(&cleaned) {
            Ok(body) => body,
            Err(e) => {
                let preview: String = pending.body.chars().take(BODY_PREVIEW_CHARS).collect();
                warn!(error = %e, "dropping action with unrecoverable JSON body");
                output.events.push(ParserEvent::Warning {
                    code: "malformed_action_json".to_string(),
                    message: format!("action dropped ({}); body: {}", e, preview),
                });
                return;
            }
        };

        let id = pending
            .id
            .unwrap_or_else(|| format!("action_{}", self.action_ordinal));
        let kind = pending.kind.unwrap_or(ActionKind::Tool);

        let action = Action {
            id: id.clone(),
            kind,
            mode: pending.mode,
            target: body.name,
            parameters: body.parameters.unwrap_or_else(|| Value::Object(Default::default())),
            depends_on: pending.depends_on,
            output_key: body.output_key,
            timeout_ms: body.timeout_ms,
            retry: body.retry,
            skip_on_error: body.skip_on_error,
            metadata: pending.metadata,
        };

        output.events.push(ParserEvent::ActionParsed {
            action_id: action.id.clone(),
            kind: action.kind,
            mode: action.mode,
            target: action.target.clone(),
        });
        output.actions.push(action);
    }

    fn finalize_feed(&mut self, output: &mut ParseOutput) {
        let body = std::mem::take(&mut self.feed_body);
        let Some(id) = self.feed_id.take() else {
            return;
        };
        let trimmed = body.trim();
        let value = serde_json::from_str::<Value>(trimmed)
            .unwrap_or_else(|_| Value::String(trimmed.to_string()));
        output.events.push(ParserEvent::ContextFeed { id, value });
    }

    fn reset_text(&mut self) {
        self.text_pending.clear();
        self.text_pending_chars = 0;
    }

    /// Append streamed text, flushing chunk events per the batching rule.
    fn push_text(&mut self, text: &str, output: &mut ParseOutput) {
        if text.is_empty() {
            return;
        }
        if self.state == ParserState::InResponse {
            if self.response_ignored {
                return;
            }
            self.response_text.push_str(text);
        }
        for c in text.chars() {
            self.text_pending.push(c);
            self.text_pending_chars += 1;
            if c == '\n' || self.text_pending_chars >= self.flush_chars {
                self.flush_text_chunk(output);
            }
        }
    }

    fn flush_text_chunk(&mut self, output: &mut ParseOutput) {
        if self.text_pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text_pending);
        self.text_pending_chars = 0;
        let event = match self.state {
            ParserState::InResponse => ParserEvent::ResponseChunk { text },
            _ => ParserEvent::ThoughtChunk { text },
        };
        output.events.push(event);
    }

    fn end_response(&mut self, output: &mut ParseOutput) {
        if self.response_ignored {
            self.response_ignored = false;
            self.reset_text();
            return;
        }
        self.flush_text_chunk(output);
        output.events.push(ParserEvent::ResponseEnd {
            raw_text: self.response_text.clone(),
            is_final: self.response_is_final,
        });
    }
}

/// Longest suffix of `buf` that is a proper prefix of `pattern`.
fn held_back_len(buf: &str, pattern: &str) -> usize {
    let max = pattern.len().saturating_sub(1).min(buf.len());
    for len in (1..=max).rev() {
        if !buf.is_char_boundary(buf.len() - len) {
            continue;
        }
        if pattern.starts_with(&buf[buf.len() - len..]) {
            return len;
        }
    }
    0
}

/// Parse a whitespace-separated `key="value"` attribute list. Values may be
/// single- or double-quoted; malformed segments are skipped.
fn parse_attributes(src: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();

        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            // Bare attribute without a value; skip it.
            continue;
        }
        i += 1;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let quote = chars[i];
        if quote != '"' && quote != '\'' {
            // Unquoted value: read to the next whitespace.
            let value_start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let value: String = chars[value_start..i].iter().collect();
            if !key.is_empty() {
                attrs.push((key, value));
            }
            continue;
        }

        i += 1;
        let value_start = i;
        while i < chars.len() && chars[i] != quote {
            i += 1;
        }
        let value: String = chars[value_start..i.min(chars.len())].iter().collect();
        if i < chars.len() {
            i += 1;
        }
        if !key.is_empty() {
            attrs.push((key, value));
        }
    }

    attrs
}
