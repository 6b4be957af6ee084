//! PowerShell serializes non-output streams to stderr as CLIXML when it runs
//! non-interactively. This module turns that back into readable lines.

use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use serde::Serialize;
use std::fmt;

pub const CLIXML_MARKER: &str = "#< CLIXML";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PsStream {
    Error,
    Warning,
    Verbose,
    Debug,
    Information,
}

impl PsStream {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "error" => Some(PsStream::Error),
            "warning" => Some(PsStream::Warning),
            "verbose" => Some(PsStream::Verbose),
            "debug" => Some(PsStream::Debug),
            "information" | "info" => Some(PsStream::Information),
            _ => None,
        }
    }
}

impl fmt::Display for PsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PsStream::Error => "error",
            PsStream::Warning => "warning",
            PsStream::Verbose => "verbose",
            PsStream::Debug => "debug",
            PsStream::Information => "information",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    pub stream: PsStream,
    pub message: String,
}

pub fn is_clixml(stderr: &str) -> bool {
    stderr.trim_start().starts_with(CLIXML_MARKER)
}

/// Parses a CLIXML document into stream records. Consecutive fragments of
/// the same stream are joined, since PowerShell splits long messages.
pub fn parse(stderr: &str) -> Result<Vec<StreamRecord>, String> {
    let document = stderr
        .trim_start()
        .strip_prefix(CLIXML_MARKER)
        .unwrap_or(stderr)
        .trim();
    let mut reader = Reader::from_reader(document.as_bytes());

    let mut buf = Vec::new();
    let mut records: Vec<StreamRecord> = Vec::new();
    let mut current: Option<(PsStream, String)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) if element.name() == QName(b"S") => {
                let stream = element
                    .attributes()
                    .flatten()
                    .find(|attr| attr.key.as_ref() == b"S")
                    .and_then(|attr| PsStream::from_tag(&String::from_utf8_lossy(&attr.value)));
                current = stream.map(|stream| (stream, String::new()));
            }
            Ok(Event::Text(text)) => {
                if let Some((_, message)) = current.as_mut() {
                    let fragment = text
                        .unescape()
                        .map_err(|err| format!("CLIXML text error: {err}"))?;
                    message.push_str(&fragment);
                }
            }
            Ok(Event::End(element)) if element.name() == QName(b"S") => {
                if let Some((stream, message)) = current.take() {
                    let message = decode_escapes(&message);
                    match records.last_mut() {
                        Some(last) if last.stream == stream && !last.message.ends_with('\n') => {
                            last.message.push_str(&message);
                        }
                        _ => records.push(StreamRecord { stream, message }),
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("CLIXML parsing error: {err}")),
            _ => {}
        }
        buf.clear();
    }

    Ok(records
        .into_iter()
        .map(|record| StreamRecord {
            stream: record.stream,
            message: record.message.trim().to_string(),
        })
        .filter(|record| !record.message.is_empty())
        .collect())
}

/// Renders records as `[stream] message` lines.
pub fn render(records: &[StreamRecord]) -> String {
    records
        .iter()
        .map(|record| format!("[{}] {}", record.stream, record.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decodes `_xHHHH_` escapes PowerShell uses for control characters.
pub fn decode_escapes(value: &str) -> String {
    let mut decoded = String::with_capacity(value.len());
    let mut cursor = 0;

    while let Some(offset) = value[cursor..].find("_x") {
        let start = cursor + offset;
        decoded.push_str(&value[cursor..start]);
        let candidate = value.get(start + 2..start + 7);
        match candidate.and_then(|hex| {
            hex.strip_suffix('_')
                .filter(|digits| digits.len() == 4)
                .and_then(|digits| u32::from_str_radix(digits, 16).ok())
                .and_then(char::from_u32)
        }) {
            Some(character) => {
                decoded.push(character);
                cursor = start + 7;
            }
            None => {
                decoded.push_str("_x");
                cursor = start + 2;
            }
        }
    }

    decoded.push_str(&value[cursor..]);
    decoded.replace("\r\n", "\n")
}
