//! Best-effort repair of truncated JSON text.
//!
//! Streamed structured output is syntactically incomplete at almost every point in
//! time. [`repair_json`] completes a truncated document with a minimal valid
//! suffix: unterminated string values are closed, open arrays and objects get
//! their closing brackets, and incomplete trailing tokens (dangling keys, partial
//! literals, broken escapes) are truncated back to the last position where the
//! document could be completed.
//!
//! The result is best-effort and never authoritative: a repaired value can be
//! structurally valid yet semantically wrong (a string closed early, a trailing
//! member dropped). Final answers always come from the strict parse + schema
//! validation that runs once the stream completes.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Expecting a value: at the root, after `:`, or after `,` in an array.
    ExpectValue,
    /// Right after `[`, where `]` is also allowed.
    ExpectValueOrClose,
    /// Right after `{`, where `}` is also allowed.
    ExpectKeyOrClose,
    /// After `,` inside an object.
    ExpectKey,
    ExpectColon,
    /// After a complete value: expecting `,`, a container close, or (at the root)
    /// only trailing whitespace.
    AfterValue,
    InString { key: bool },
    InNumber,
    InLiteral { literal: &'static str, matched: usize },
}

#[derive(Debug, Clone, Copy)]
enum Escape {
    /// Just saw `\`, the escape designator is pending.
    Designator { start: usize },
    /// Inside `\uXXXX`, `remaining` hex digits pending.
    Hex { start: usize, remaining: u8 },
}

fn is_json_ws(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r')
}

fn start_value(
    ch: char,
    i: usize,
    stack: &mut Vec<Container>,
    committed: &mut Option<usize>,
) -> Option<State> {
    Some(match ch {
        '"' => State::InString { key: false },
        '{' => {
            stack.push(Container::Object);
            *committed = Some(i + 1);
            State::ExpectKeyOrClose
        }
        '[' => {
            stack.push(Container::Array);
            *committed = Some(i + 1);
            State::ExpectValueOrClose
        }
        '-' => State::InNumber,
        '0'..='9' => {
            *committed = Some(i + 1);
            State::InNumber
        }
        't' => State::InLiteral {
            literal: "true",
            matched: 1,
        },
        'f' => State::InLiteral {
            literal: "false",
            matched: 1,
        },
        'n' => State::InLiteral {
            literal: "null",
            matched: 1,
        },
        _ => return None,
    })
}

/// Completes truncated JSON with a minimal valid suffix.
///
/// Returns `None` when the input is malformed beyond truncation (e.g. a stray
/// token) or holds no completable prefix yet. Already-valid input comes back
/// unchanged.
pub fn repair_json(input: &str) -> Option<String> {
    let mut stack: Vec<Container> = Vec::new();
    let mut state = State::ExpectValue;
    // One past the last byte that, kept together with closing brackets for the
    // current stack, forms valid JSON.
    let mut committed: Option<usize> = None;
    let mut escape: Option<Escape> = None;

    for (i, ch) in input.char_indices() {
        loop {
            match state {
                State::ExpectValue => {
                    if is_json_ws(ch) {
                        break;
                    }
                    escape = None;
                    state = start_value(ch, i, &mut stack, &mut committed)?;
                }
                State::ExpectValueOrClose => {
                    if is_json_ws(ch) {
                        break;
                    }
                    if ch == ']' {
                        match stack.pop() {
                            Some(Container::Array) => {}
                            _ => return None,
                        }
                        committed = Some(i + 1);
                        state = State::AfterValue;
                        break;
                    }
                    escape = None;
                    state = start_value(ch, i, &mut stack, &mut committed)?;
                }
                State::ExpectKeyOrClose => match ch {
                    c if is_json_ws(c) => {}
                    '"' => {
                        escape = None;
                        state = State::InString { key: true };
                    }
                    '}' => {
                        match stack.pop() {
                            Some(Container::Object) => {}
                            _ => return None,
                        }
                        committed = Some(i + 1);
                        state = State::AfterValue;
                    }
                    _ => return None,
                },
                State::ExpectKey => match ch {
                    c if is_json_ws(c) => {}
                    '"' => {
                        escape = None;
                        state = State::InString { key: true };
                    }
                    _ => return None,
                },
                State::ExpectColon => match ch {
                    c if is_json_ws(c) => {}
                    ':' => state = State::ExpectValue,
                    _ => return None,
                },
                State::AfterValue => match ch {
                    c if is_json_ws(c) => {}
                    ',' => match stack.last() {
                        Some(Container::Object) => state = State::ExpectKey,
                        Some(Container::Array) => state = State::ExpectValue,
                        None => return None,
                    },
                    '}' => match stack.pop() {
                        Some(Container::Object) => committed = Some(i + 1),
                        _ => return None,
                    },
                    ']' => match stack.pop() {
                        Some(Container::Array) => committed = Some(i + 1),
                        _ => return None,
                    },
                    _ => return None,
                },
                State::InString { key } => match escape {
                    Some(Escape::Designator { start }) => {
                        escape = if ch == 'u' {
                            Some(Escape::Hex {
                                start,
                                remaining: 4,
                            })
                        } else {
                            None
                        };
                    }
                    Some(Escape::Hex { start, remaining }) => {
                        escape = if remaining > 1 {
                            Some(Escape::Hex {
                                start,
                                remaining: remaining - 1,
                            })
                        } else {
                            None
                        };
                    }
                    None => match ch {
                        '\\' => escape = Some(Escape::Designator { start: i }),
                        '"' => {
                            if key {
                                state = State::ExpectColon;
                            } else {
                                committed = Some(i + 1);
                                state = State::AfterValue;
                            }
                        }
                        _ => {}
                    },
                },
                State::InNumber => match ch {
                    '0'..='9' => committed = Some(i + 1),
                    '.' | 'e' | 'E' | '+' | '-' => {}
                    _ => {
                        // The number ended; reprocess this char as a delimiter.
                        state = State::AfterValue;
                        continue;
                    }
                },
                State::InLiteral { literal, matched } => {
                    if literal.chars().nth(matched) != Some(ch) {
                        return None;
                    }
                    if matched + 1 == literal.len() {
                        committed = Some(i + 1);
                        state = State::AfterValue;
                    } else {
                        state = State::InLiteral {
                            literal,
                            matched: matched + 1,
                        };
                    }
                }
            }
            break;
        }
    }

    let mut out = match state {
        // An unterminated string value keeps its partial content; only a broken
        // trailing escape is cut.
        State::InString { key: false } => {
            let cut = match escape {
                Some(Escape::Designator { start }) | Some(Escape::Hex { start, .. }) => start,
                None => input.len(),
            };
            let mut s = String::with_capacity(cut + stack.len() + 1);
            s.push_str(&input[..cut]);
            s.push('"');
            s
        }
        // Everything else truncates to the last completable position.
        _ => {
            let end = committed?;
            let mut s = String::with_capacity(end + stack.len());
            s.push_str(&input[..end]);
            s
        }
    };
    for container in stack.iter().rev() {
        out.push(match container {
            Container::Object => '}',
            Container::Array => ']',
        });
    }
    Some(out)
}

/// Best-effort parse of possibly-truncated JSON.
///
/// Tries a strict parse first, then repair + reparse. `None` means "needs more
/// data", a routine condition mid-stream, never an error.
pub fn parse_partial_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let repaired = repair_json(trimmed)?;
    serde_json::from_str(&repaired).ok()
}
