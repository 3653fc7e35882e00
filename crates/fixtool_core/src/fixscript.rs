use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

pub const ENTRY_ROUTINE_MARKER: &str = "def main";
pub const CALL_PREFIX: &str = "util.";
pub const ADDITIONAL_FIXES: &str = "additional_fixes";

const DOC_DELIMITERS: [&str; 2] = ["\"\"\"", "'''"];

const ARGUMENT_STYLES: [(&str, ArgumentStyle); 6] = [
    ("winedll_override", ArgumentStyle::KeyValue),
    ("set_environment", ArgumentStyle::KeyValue),
    ("replace_command", ArgumentStyle::KeyValue),
    ("regedit_add", ArgumentStyle::Verbatim),
    ("append_arguments", ArgumentStyle::Verbatim),
    ("set_ini_options", ArgumentStyle::Verbatim),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgumentStyle {
    /// Two string arguments folded into `key=value`.
    KeyValue,
    /// Original argument text, quoting included.
    Verbatim,
    Plain,
}

fn argument_style(name: &str) -> ArgumentStyle {
    ARGUMENT_STYLES
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, style)| *style)
        .unwrap_or(ArgumentStyle::Plain)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Argument {
    /// Rendered as `name: value`.
    Labelled(String),
    /// Rendered as `name(raw)`.
    Call(String),
}

/// One normalized `util.*` invocation. The canonical text form is what the
/// rest of the pipeline compares and prints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FixOperation {
    name: String,
    argument: Option<Argument>,
}

impl FixOperation {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: None,
        }
    }

    pub fn labelled(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: Some(Argument::Labelled(value.into())),
        }
    }

    pub fn call(name: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument: Some(Argument::Call(raw.into())),
        }
    }

    pub fn additional_fixes() -> Self {
        Self::bare(ADDITIONAL_FIXES)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn argument(&self) -> Option<&Argument> {
        self.argument.as_ref()
    }

    /// Argument text regardless of how it is rendered.
    pub fn argument_text(&self) -> Option<&str> {
        match &self.argument {
            Some(Argument::Labelled(value)) | Some(Argument::Call(value)) => Some(value.as_str()),
            None => None,
        }
    }

    /// Splits a labelled `key=value` argument on the first `=`.
    pub fn key_value(&self) -> Option<(&str, &str)> {
        match &self.argument {
            Some(Argument::Labelled(value)) => value.split_once('='),
            _ => None,
        }
    }
}

impl fmt::Display for FixOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.argument {
            None => f.write_str(&self.name),
            Some(Argument::Labelled(value)) => write!(f, "{}: {value}", self.name),
            Some(Argument::Call(raw)) => write!(f, "{}({raw})", self.name),
        }
    }
}

impl FromStr for FixOperation {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some((name, argument)) = value.split_once(": ")
            && is_identifier(name)
        {
            return Ok(Self::labelled(name, argument));
        }
        if let Some(open) = value.find('(')
            && let Some(inner) = value[open + 1..].strip_suffix(')')
            && is_identifier(&value[..open])
        {
            return Ok(Self::call(&value[..open], inner));
        }
        Ok(Self::bare(value))
    }
}

impl Serialize for FixOperation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Extract the operations of a fix script's entry routine, in source order.
///
/// Lines inside the routine that are not `util.*` calls cannot be linearized
/// statically; their presence is recorded with one trailing
/// `additional_fixes` operation.
pub fn parse_fix_script(source: &str) -> Vec<FixOperation> {
    let mut operations = Vec::new();
    let mut in_entry_routine = false;
    let mut open_string: Option<OpenString> = None;
    let mut has_unhandled_logic = false;

    for line in source.lines() {
        if line.starts_with(ENTRY_ROUTINE_MARKER) {
            in_entry_routine = true;
            continue;
        }
        if !in_entry_routine {
            continue;
        }

        let trimmed = line.trim();
        if let Some(open) = open_string {
            match trimmed.find(open.delimiter) {
                Some(index) => {
                    let rest = &trimmed[index + open.delimiter.len()..];
                    open_string = unclosed_delimiter(rest).map(|delimiter| OpenString {
                        delimiter,
                        ..open
                    });
                }
                None if open.is_doc || trimmed.is_empty() || trimmed.starts_with('#') => {}
                None => has_unhandled_logic = true,
            }
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if starts_doc_block(trimmed) {
            open_string = unclosed_delimiter(trimmed).map(|delimiter| OpenString {
                delimiter,
                is_doc: true,
            });
            continue;
        }

        match tokenize_call(trimmed) {
            Some(call) => operations.push(normalize_call(call)),
            None => has_unhandled_logic = true,
        }
        open_string = unclosed_delimiter(trimmed).map(|delimiter| OpenString {
            delimiter,
            is_doc: false,
        });
    }

    if has_unhandled_logic {
        operations.push(FixOperation::additional_fixes());
    }
    operations
}

/// A triple-quoted string still open at the end of a line. Body lines of a
/// string literal count as unhandled logic; docstring bodies do not.
#[derive(Debug, Clone, Copy)]
struct OpenString {
    delimiter: &'static str,
    is_doc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawCall<'a> {
    name: &'a str,
    argument: Option<&'a str>,
}

fn starts_doc_block(line: &str) -> bool {
    DOC_DELIMITERS
        .iter()
        .any(|delimiter| line.starts_with(delimiter))
}

/// Delimiter of the triple-quoted string left open after `text`, if any.
fn unclosed_delimiter(mut text: &str) -> Option<&'static str> {
    loop {
        let (index, delimiter) = DOC_DELIMITERS
            .into_iter()
            .filter_map(|delimiter| text.find(delimiter).map(|index| (index, delimiter)))
            .min_by_key(|(index, _)| *index)?;
        let body = &text[index + delimiter.len()..];
        let Some(close) = body.find(delimiter) else {
            return Some(delimiter);
        };
        text = &body[close + delimiter.len()..];
    }
}

fn tokenize_call(line: &str) -> Option<RawCall<'_>> {
    let rest = line.strip_prefix(CALL_PREFIX)?;
    let name_end = rest
        .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    if name.is_empty() {
        return None;
    }

    let argument = rest[name_end..]
        .trim_start()
        .strip_prefix('(')
        .map(|inner| call_arguments(inner).trim());
    Some(RawCall { name, argument })
}

/// Text up to the parenthesis closing the call. An unterminated call (the
/// arguments continue on the next lines) keeps the rest of the line.
fn call_arguments(inner: &str) -> &str {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (index, ch) in inner.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' if depth == 0 => return &inner[..index],
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    inner
}

fn normalize_call(call: RawCall<'_>) -> FixOperation {
    let Some(raw) = call.argument.filter(|raw| !raw.is_empty()) else {
        return FixOperation::bare(call.name);
    };

    match argument_style(call.name) {
        ArgumentStyle::Verbatim => FixOperation::call(call.name, raw),
        ArgumentStyle::KeyValue => match string_literals(raw).as_deref() {
            Some([key, value]) => FixOperation::labelled(call.name, format!("{key}={value}")),
            Some([value]) => FixOperation::labelled(call.name, value.as_str()),
            _ => FixOperation::call(call.name, raw),
        },
        ArgumentStyle::Plain => match string_literals(raw).as_deref() {
            Some([value]) => FixOperation::labelled(call.name, value.as_str()),
            _ => FixOperation::call(call.name, raw),
        },
    }
}

/// Decode a comma separated list of single-line string literals. Returns
/// `None` as soon as one argument is anything else.
fn string_literals(raw: &str) -> Option<Vec<String>> {
    let mut values = Vec::new();
    let mut chars = raw.trim().chars().peekable();
    loop {
        while chars.next_if(|ch| ch.is_whitespace()).is_some() {}
        let quote = chars.next().filter(|ch| *ch == '\'' || *ch == '"')?;
        if chars.peek() == Some(&quote) {
            chars.next();
            if chars.peek() == Some(&quote) {
                return None;
            }
            values.push(String::new());
        } else {
            let mut value = String::new();
            loop {
                match chars.next()? {
                    ch if ch == quote => break,
                    '\\' => match chars.next()? {
                        escaped @ ('\\' | '\'' | '"') => value.push(escaped),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    },
                    ch => value.push(ch),
                }
            }
            values.push(value);
        }

        while chars.next_if(|ch| ch.is_whitespace()).is_some() {}
        match chars.next() {
            None => return Some(values),
            Some(',') => {
                while chars.next_if(|ch| ch.is_whitespace()).is_some() {}
                if chars.peek().is_none() {
                    return Some(values);
                }
            }
            Some(_) => return None,
        }
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
