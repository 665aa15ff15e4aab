//! Incremental tag parser over streamed model output.
//!
//! Model output carries structured sections in bracket tags:
//!
//! ```text
//! [THINKING] ... [/THINKING]
//! [RESPONSE] ... (implicit to end)
//! [SUMMARY] ... [/SUMMARY]
//! [PLAN] ... [/PLAN]
//! [FILE_READ] path: <p> [/FILE_READ]
//! [FILE_WRITE] path: <p> content: <fenced block> [/FILE_WRITE]
//! [FILE_EDIT] path: <p> find: |<block> replace: |<block> [/FILE_EDIT]
//! ```
//!
//! [`ResponseParser`] consumes deltas as they arrive and emits
//! [`ParseEvent`]s in production order. Text outside any tag streams out as
//! response text; thinking text streams as it arrives; structured tags are
//! buffered until their closer and emitted as one event. A partial tag
//! token at the end of the buffer is held back until more input decides
//! whether it is a tag or plain text.
//!
//! Parsing is deterministic and restartable: feeding the final buffer in
//! one piece yields the same event sequence as incremental feeding, modulo
//! text chunk boundaries (the concatenated text per contiguous run is
//! identical).

use regex::Regex;

/// Output channel of a text event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextChannel {
    /// Inside a `[THINKING]` block.
    Thinking,
    /// Everything else.
    Response,
}

/// A file operation embedded in model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    /// Read a file and feed its contents back to the conversation.
    Read {
        /// Path to read.
        path: String,
    },
    /// Write a file.
    Write {
        /// Path to write.
        path: String,
        /// Content to write.
        content: String,
    },
    /// Find-and-replace inside a file.
    Edit {
        /// Path to edit.
        path: String,
        /// Text to find.
        find: String,
        /// Replacement text.
        replace: String,
    },
}

/// One event lifted out of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// A fragment of thinking or response text.
    Text {
        /// Which channel the fragment belongs to.
        channel: TextChannel,
        /// The fragment itself.
        chunk: String,
    },
    /// Body of a `[SUMMARY]` block.
    Summary(String),
    /// Body of a `[PLAN]` block, ready for the plan parser.
    Plan(String),
    /// A parsed file operation.
    FileOp(FileOperation),
}

/// Tags whose body buffers until the closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferedTag {
    Summary,
    Plan,
    FileRead,
    FileWrite,
    FileEdit,
}

impl BufferedTag {
    fn opener(&self) -> &'static str {
        match self {
            BufferedTag::Summary => "[SUMMARY]",
            BufferedTag::Plan => "[PLAN]",
            BufferedTag::FileRead => "[FILE_READ]",
            BufferedTag::FileWrite => "[FILE_WRITE]",
            BufferedTag::FileEdit => "[FILE_EDIT]",
        }
    }

    fn closer(&self) -> &'static str {
        match self {
            BufferedTag::Summary => "[/SUMMARY]",
            BufferedTag::Plan => "[/PLAN]",
            BufferedTag::FileRead => "[/FILE_READ]",
            BufferedTag::FileWrite => "[/FILE_WRITE]",
            BufferedTag::FileEdit => "[/FILE_EDIT]",
        }
    }
}

/// What finding a token in streaming mode does.
#[derive(Debug, Clone, Copy)]
enum TokenAction {
    EnterThinking,
    LeaveThinking,
    EnterResponse,
    OpenBuffered(BufferedTag),
}

/// Tokens recognised while streaming response text.
const RESPONSE_TOKENS: &[(&str, TokenAction)] = &[
    ("[THINKING]", TokenAction::EnterThinking),
    ("[RESPONSE]", TokenAction::EnterResponse),
    ("[SUMMARY]", TokenAction::OpenBuffered(BufferedTag::Summary)),
    ("[PLAN]", TokenAction::OpenBuffered(BufferedTag::Plan)),
    ("[FILE_READ]", TokenAction::OpenBuffered(BufferedTag::FileRead)),
    ("[FILE_WRITE]", TokenAction::OpenBuffered(BufferedTag::FileWrite)),
    ("[FILE_EDIT]", TokenAction::OpenBuffered(BufferedTag::FileEdit)),
];

/// The only token recognised inside a thinking block.
const THINKING_TOKENS: &[(&str, TokenAction)] = &[("[/THINKING]", TokenAction::LeaveThinking)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Streaming(TextChannel),
    Buffering(BufferedTag),
}

/// Incremental parser state over a growing output buffer.
#[derive(Debug)]
pub struct ResponseParser {
    buffer: String,
    mode: Mode,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// Start a parser at the top of a fresh assistant message.
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            mode: Mode::Streaming(TextChannel::Response),
        }
    }

    /// Feed one delta and collect the events it releases.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        self.drain(&mut events);
        events
    }

    /// Signal end of stream, flushing held text and unterminated tags.
    ///
    /// An unterminated buffered tag degrades to response text, opener
    /// included, so nothing the model produced is silently dropped.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut events = Vec::new();
        match self.mode {
            Mode::Streaming(channel) => {
                if !self.buffer.is_empty() {
                    events.push(ParseEvent::Text {
                        channel,
                        chunk: std::mem::take(&mut self.buffer),
                    });
                }
            }
            Mode::Buffering(tag) => {
                let body = std::mem::take(&mut self.buffer);
                events.push(ParseEvent::Text {
                    channel: TextChannel::Response,
                    chunk: format!("{}{}", tag.opener(), body),
                });
            }
        }
        self.mode = Mode::Streaming(TextChannel::Response);
        events
    }

    /// Parse a complete buffer in one call.
    pub fn parse_complete(text: &str) -> Vec<ParseEvent> {
        let mut parser = Self::new();
        let mut events = parser.feed(text);
        events.extend(parser.finish());
        events
    }

    fn drain(&mut self, events: &mut Vec<ParseEvent>) {
        loop {
            match self.mode {
                Mode::Streaming(channel) => {
                    let tokens = match channel {
                        TextChannel::Response => RESPONSE_TOKENS,
                        TextChannel::Thinking => THINKING_TOKENS,
                    };

                    match earliest_token(&self.buffer, tokens) {
                        Some((idx, token, action)) => {
                            if idx > 0 {
                                events.push(ParseEvent::Text {
                                    channel,
                                    chunk: self.buffer[..idx].to_string(),
                                });
                            }
                            self.buffer.drain(..idx + token.len());
                            self.mode = match action {
                                TokenAction::EnterThinking => {
                                    Mode::Streaming(TextChannel::Thinking)
                                }
                                TokenAction::LeaveThinking | TokenAction::EnterResponse => {
                                    Mode::Streaming(TextChannel::Response)
                                }
                                TokenAction::OpenBuffered(tag) => Mode::Buffering(tag),
                            };
                        }
                        None => {
                            // Hold back a suffix that might grow into a tag.
                            let hold = prefix_hold(&self.buffer, tokens);
                            let release = self.buffer.len() - hold;
                            if release > 0 {
                                let chunk: String = self.buffer.drain(..release).collect();
                                events.push(ParseEvent::Text { channel, chunk });
                            }
                            return;
                        }
                    }
                }
                Mode::Buffering(tag) => match self.buffer.find(tag.closer()) {
                    Some(idx) => {
                        let body: String = self.buffer.drain(..idx).collect();
                        self.buffer.drain(..tag.closer().len());
                        self.mode = Mode::Streaming(TextChannel::Response);
                        events.push(tag_event(tag, &body));
                    }
                    None => return,
                },
            }
        }
    }
}

/// Find the earliest token occurrence in the buffer.
fn earliest_token(
    buffer: &str,
    tokens: &[(&'static str, TokenAction)],
) -> Option<(usize, &'static str, TokenAction)> {
    tokens
        .iter()
        .filter_map(|(token, action)| buffer.find(token).map(|idx| (idx, *token, *action)))
        .min_by_key(|(idx, token, _)| (*idx, std::cmp::Reverse(token.len())))
}

/// Length of the longest buffer suffix that is a proper prefix of some
/// token. That many bytes stay buffered until more input arrives.
fn prefix_hold(buffer: &str, tokens: &[(&'static str, TokenAction)]) -> usize {
    let max_hold = tokens
        .iter()
        .map(|(token, _)| token.len() - 1)
        .max()
        .unwrap_or(0)
        .min(buffer.len());

    for hold in (1..=max_hold).rev() {
        let at = buffer.len() - hold;
        if !buffer.is_char_boundary(at) {
            continue;
        }
        let suffix = &buffer[at..];
        if tokens.iter().any(|(token, _)| token.starts_with(suffix)) {
            return hold;
        }
    }
    0
}

/// Turn a closed tag body into its event. A file-op body that does not
/// parse degrades to response text with the tags restored.
fn tag_event(tag: BufferedTag, body: &str) -> ParseEvent {
    let parsed = match tag {
        BufferedTag::Summary => return ParseEvent::Summary(body.trim().to_string()),
        BufferedTag::Plan => return ParseEvent::Plan(body.trim().to_string()),
        BufferedTag::FileRead => parse_file_read(body),
        BufferedTag::FileWrite => parse_file_write(body),
        BufferedTag::FileEdit => parse_file_edit(body),
    };

    match parsed {
        Some(op) => ParseEvent::FileOp(op),
        None => ParseEvent::Text {
            channel: TextChannel::Response,
            chunk: format!("{}{}{}", tag.opener(), body, tag.closer()),
        },
    }
}

fn parse_file_read(body: &str) -> Option<FileOperation> {
    let re = Regex::new(r"path:\s*(\S[^\n]*)").unwrap();
    let caps = re.captures(body)?;
    Some(FileOperation::Read {
        path: caps[1].trim().to_string(),
    })
}

fn parse_file_write(body: &str) -> Option<FileOperation> {
    let re = Regex::new(r"(?s)path:\s*(?P<path>.+?)\s*content:\s*(?P<content>.*)").unwrap();
    let caps = re.captures(body.trim())?;
    let path = caps["path"].trim().to_string();
    if path.is_empty() {
        return None;
    }
    Some(FileOperation::Write {
        path,
        content: strip_fence(&caps["content"]),
    })
}

fn parse_file_edit(body: &str) -> Option<FileOperation> {
    let re = Regex::new(
        r"(?s)path:\s*(?P<path>.+?)\s*find:\s*\|(?P<find>.*?)\s*replace:\s*\|(?P<replace>.*)",
    )
    .unwrap();
    let caps = re.captures(body.trim())?;
    let path = caps["path"].trim().to_string();
    if path.is_empty() {
        return None;
    }
    Some(FileOperation::Edit {
        path,
        find: caps["find"].trim_end().trim_start_matches('\n').to_string(),
        replace: caps["replace"].trim_end().trim_start_matches('\n').to_string(),
    })
}

/// Unwrap a ``` fenced block, dropping an optional language tag; plain
/// text passes through trimmed.
fn strip_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(newline) = rest.find('\n') {
            let inner = &rest[newline + 1..];
            if let Some(end) = inner.rfind("```") {
                return inner[..end].trim_end_matches('\n').to_string();
            }
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Concatenate text runs so chunk boundaries don't affect equality.
    fn normalized(events: Vec<ParseEvent>) -> Vec<ParseEvent> {
        let mut out: Vec<ParseEvent> = Vec::new();
        for event in events {
            match (&event, out.last_mut()) {
                (
                    ParseEvent::Text { channel, chunk },
                    Some(ParseEvent::Text {
                        channel: last_channel,
                        chunk: last_chunk,
                    }),
                ) if channel == last_channel => last_chunk.push_str(chunk),
                _ => out.push(event),
            }
        }
        // drop empty text runs
        out.retain(|e| !matches!(e, ParseEvent::Text { chunk, .. } if chunk.is_empty()));
        out
    }

    fn text(channel: TextChannel, s: &str) -> ParseEvent {
        ParseEvent::Text {
            channel,
            chunk: s.to_string(),
        }
    }

    #[test]
    fn plain_text_streams_as_response() {
        let events = ResponseParser::parse_complete("hello there");
        assert_eq!(
            normalized(events),
            vec![text(TextChannel::Response, "hello there")]
        );
    }

    #[test]
    fn thinking_block_switches_channels() {
        let events =
            ResponseParser::parse_complete("[THINKING]weighing options[/THINKING]answer");
        assert_eq!(
            normalized(events),
            vec![
                text(TextChannel::Thinking, "weighing options"),
                text(TextChannel::Response, "answer"),
            ]
        );
    }

    #[test]
    fn response_tag_is_transparent() {
        let events = ResponseParser::parse_complete("[RESPONSE]the answer");
        assert_eq!(
            normalized(events),
            vec![text(TextChannel::Response, "the answer")]
        );
    }

    #[test]
    fn summary_is_buffered_and_trimmed() {
        let events = ResponseParser::parse_complete("done[SUMMARY]\nall tests pass\n[/SUMMARY]");
        assert_eq!(
            normalized(events),
            vec![
                text(TextChannel::Response, "done"),
                ParseEvent::Summary("all tests pass".to_string()),
            ]
        );
    }

    #[test]
    fn plan_body_is_captured_whole() {
        let body = "## Workflow: demo\n### Step 1: x\n- Agent: main\n- Tool: list_files_tool\n- Arguments: {}";
        let events = ResponseParser::parse_complete(&format!("[PLAN]\n{body}\n[/PLAN]"));
        assert_eq!(normalized(events), vec![ParseEvent::Plan(body.to_string())]);
    }

    #[test]
    fn file_read_parses_path() {
        let events = ResponseParser::parse_complete("[FILE_READ] path: src/lib.rs [/FILE_READ]");
        assert_eq!(
            normalized(events),
            vec![ParseEvent::FileOp(FileOperation::Read {
                path: "src/lib.rs".to_string()
            })]
        );
    }

    #[test]
    fn file_write_unwraps_fenced_content() {
        let input = "[FILE_WRITE] path: out.py content: ```python\nprint('hi')\n``` [/FILE_WRITE]";
        let events = ResponseParser::parse_complete(input);
        assert_eq!(
            normalized(events),
            vec![ParseEvent::FileOp(FileOperation::Write {
                path: "out.py".to_string(),
                content: "print('hi')".to_string(),
            })]
        );
    }

    #[test]
    fn file_edit_splits_find_and_replace_blocks() {
        let input = "[FILE_EDIT]\npath: main.rs\nfind: |old line\nreplace: |new line\n[/FILE_EDIT]";
        let events = ResponseParser::parse_complete(input);
        assert_eq!(
            normalized(events),
            vec![ParseEvent::FileOp(FileOperation::Edit {
                path: "main.rs".to_string(),
                find: "old line".to_string(),
                replace: "new line".to_string(),
            })]
        );
    }

    #[test]
    fn malformed_file_op_degrades_to_text() {
        let input = "[FILE_WRITE] no path here [/FILE_WRITE]";
        let events = ResponseParser::parse_complete(input);
        assert_eq!(
            normalized(events),
            vec![text(TextChannel::Response, input)]
        );
    }

    #[test]
    fn partial_tag_is_held_across_feeds() {
        let mut parser = ResponseParser::new();
        let mut events = parser.feed("before [SUM");
        // "[SUM" could become "[SUMMARY]", so only the prefix streams out
        assert_eq!(normalized(events.clone()), vec![text(TextChannel::Response, "before ")]);

        events.extend(parser.feed("MARY]body[/SUMM"));
        events.extend(parser.feed("ARY] after"));
        events.extend(parser.finish());

        assert_eq!(
            normalized(events),
            vec![
                text(TextChannel::Response, "before "),
                ParseEvent::Summary("body".to_string()),
                text(TextChannel::Response, " after"),
            ]
        );
    }

    #[test]
    fn bracket_text_that_is_not_a_tag_streams_through() {
        let mut parser = ResponseParser::new();
        let mut events = parser.feed("an array[3] of things [maybe]");
        events.extend(parser.finish());
        assert_eq!(
            normalized(events),
            vec![text(TextChannel::Response, "an array[3] of things [maybe]")]
        );
    }

    #[test]
    fn unterminated_tag_flushes_as_text() {
        let mut parser = ResponseParser::new();
        let mut events = parser.feed("[SUMMARY]never closed");
        assert!(normalized(events.clone()).is_empty());
        events.extend(parser.finish());
        assert_eq!(
            normalized(events),
            vec![text(TextChannel::Response, "[SUMMARY]never closed")]
        );
    }

    #[test]
    fn incremental_and_batch_parsing_agree() {
        let input = "[THINKING]plan the work[/THINKING]Here you go.\n\
                     [FILE_WRITE] path: a.txt content: ```\npayload\n``` [/FILE_WRITE]\n\
                     tail [SUMMARY]wrote a.txt[/SUMMARY]";

        let batch = normalized(ResponseParser::parse_complete(input));

        // feed one character at a time
        let mut parser = ResponseParser::new();
        let mut events = Vec::new();
        let mut buf = [0u8; 4];
        for ch in input.chars() {
            events.extend(parser.feed(ch.encode_utf8(&mut buf)));
        }
        events.extend(parser.finish());

        assert_eq!(normalized(events), batch);
    }

    #[test]
    fn multiple_operations_preserve_order() {
        let input = "[FILE_READ] path: a [/FILE_READ][FILE_READ] path: b [/FILE_READ]";
        let events = ResponseParser::parse_complete(input);
        assert_eq!(
            normalized(events),
            vec![
                ParseEvent::FileOp(FileOperation::Read { path: "a".to_string() }),
                ParseEvent::FileOp(FileOperation::Read { path: "b".to_string() }),
            ]
        );
    }
}
