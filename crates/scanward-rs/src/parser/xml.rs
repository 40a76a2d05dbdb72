use std::collections::HashSet;

use quick_xml::{
    escape::{unescape, EscapeError},
    events::{attributes::AttrError, BytesStart, Event},
    Reader,
};
use serde_json::{Map, Number, Value};

pub const ATTRIBUTE_PREFIX: &str = "@";
pub const TEXT_KEY: &str = "#text";

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("xml syntax error at byte {position}: {source}")]
    Syntax {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("bad attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("bad escape sequence: {0}")]
    Escape(#[from] EscapeError),
    #[error("undecodable content: {0}")]
    Decode(String),
    #[error("element <{0}> is never closed")]
    Unclosed(String),
}

/// Attributes become `@`-prefixed keys. Elements in the array table are always
/// sequences; anything else only when it repeats.
#[derive(Debug, Clone)]
pub struct XmlFlattener {
    array_elements: HashSet<&'static str>,
}

struct Frame {
    name: String,
    fields: Map<String, Value>,
    text: String,
}

impl Frame {
    fn new(name: String) -> Self {
        Self {
            name,
            fields: Map::new(),
            text: String::new(),
        }
    }

    fn finish(mut self) -> (String, Value) {
        let value = match (self.fields.is_empty(), self.text.is_empty()) {
            (true, false) => Value::String(self.text),
            (_, true) => Value::Object(self.fields),
            (false, false) => {
                self.fields
                    .insert(TEXT_KEY.to_string(), Value::String(self.text));
                Value::Object(self.fields)
            }
        };
        (self.name, value)
    }
}

impl XmlFlattener {
    pub fn new(array_elements: &[&'static str]) -> Self {
        Self {
            array_elements: array_elements.iter().copied().collect(),
        }
    }

    pub fn flatten(&self, xml: &str) -> Result<Value, TreeError> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        let mut stack = vec![Frame::new(String::new())];

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|source| TreeError::Syntax {
                    position: reader.buffer_position() as u64,
                    source,
                })?;
            match event {
                Event::Start(e) => stack.push(self.open(&e)?),
                Event::Empty(e) => {
                    let frame = self.open(&e)?;
                    self.close(&mut stack, frame);
                }
                Event::End(_) => {
                    // The document frame is never popped; quick-xml rejects
                    // unmatched end tags before we get here.
                    if stack.len() > 1 {
                        if let Some(frame) = stack.pop() {
                            self.close(&mut stack, frame);
                        }
                    }
                }
                Event::Text(t) => {
                    let raw = reader
                        .decoder()
                        .decode(&t)
                        .map_err(|e| TreeError::Decode(e.to_string()))?;
                    let text = unescape(&raw)?;
                    append_text(&mut stack, text.trim());
                }
                Event::CData(c) => {
                    let bytes = c.into_inner();
                    append_text(&mut stack, String::from_utf8_lossy(&bytes).trim());
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if stack.len() > 1 {
            let name = stack.last().map(|f| f.name.clone()).unwrap_or_default();
            return Err(TreeError::Unclosed(name));
        }
        let document = stack.pop().map(|f| f.fields).unwrap_or_default();
        Ok(Value::Object(document))
    }

    fn open(&self, element: &BytesStart<'_>) -> Result<Frame, TreeError> {
        let mut frame = Frame::new(String::from_utf8_lossy(element.name().as_ref()).to_string());
        for attr in element.attributes() {
            let attr = attr?;
            let key = format!(
                "{ATTRIBUTE_PREFIX}{}",
                String::from_utf8_lossy(attr.key.as_ref())
            );
            let raw = attr
                .unescape_value()
                .map_err(|e| TreeError::Decode(e.to_string()))?;
            frame.fields.insert(key, coerce_attribute(&raw));
        }
        Ok(frame)
    }

    fn close(&self, stack: &mut [Frame], frame: Frame) {
        let Some(parent) = stack.last_mut() else {
            return;
        };
        let (name, value) = frame.finish();
        if self.array_elements.contains(name.as_str()) {
            match parent
                .fields
                .entry(name)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(items) => items.push(value),
                other => {
                    let first = other.take();
                    *other = Value::Array(vec![first, value]);
                }
            }
            return;
        }
        match parent.fields.get_mut(&name) {
            None => {
                parent.fields.insert(name, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }
}

fn append_text(stack: &mut [Frame], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(top) = stack.last_mut() {
        if !top.text.is_empty() {
            top.text.push(' ');
        }
        top.text.push_str(text);
    }
}

/// Only canonical spellings are coerced: `"80"` becomes a number but `"080"`
/// and `"7.80"` stay text, so no information is lost.
pub fn coerce_attribute(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        if n.to_string() == raw {
            return Value::Number(n.into());
        }
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() && f.to_string() == raw {
            if let Some(n) = Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(raw.to_string())
}
