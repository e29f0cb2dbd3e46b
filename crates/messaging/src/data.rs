//! Opaque named payloads carried by messages, results and instance inputs.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A named, opaque payload. The engine never interprets `content` except
/// when a condition refers to it by name.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessData {
    pub name: String,
    #[serde(with = "content")]
    pub content: Vec<u8>,
}

impl ProcessData {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), content: content.into() }
    }

    pub fn text(name: impl Into<String>, text: &str) -> Self {
        Self::new(name, text.as_bytes().to_vec())
    }

    /// The content as UTF-8, if it is.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    /// Find the payload called `name`.
    pub fn lookup<'a>(data: &'a [ProcessData], name: &str) -> Option<&'a ProcessData> {
        data.iter().find(|d| d.name == name)
    }
}

impl fmt::Debug for ProcessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ProcessData");
        s.field("name", &self.name);
        match self.as_text() {
            Some(text) => s.field("content", &text),
            None => s.field("content", &format_args!("<{} bytes>", self.content.len())),
        };
        s.finish()
    }
}

/// Content is written as a string when it is UTF-8 and as a byte array
/// otherwise; both forms are accepted on input.
mod content {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(content) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => content.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_by_name() {
        let data = vec![ProcessData::text("amount", "12"), ProcessData::text("customer", "acme")];
        assert_eq!(ProcessData::lookup(&data, "customer").and_then(|d| d.as_text()), Some("acme"));
        assert!(ProcessData::lookup(&data, "missing").is_none());
    }

    #[test]
    fn content_accepts_text_and_bytes() {
        let text: ProcessData = serde_json::from_str(r#"{"name":"a","content":"hi"}"#).unwrap();
        let bytes: ProcessData = serde_json::from_str(r#"{"name":"a","content":[104,105]}"#).unwrap();
        assert_eq!(text, bytes);
        assert_eq!(serde_json::to_string(&text).unwrap(), r#"{"name":"a","content":"hi"}"#);

        let binary = ProcessData::new("b", vec![0xff, 0x00]);
        assert_eq!(serde_json::to_string(&binary).unwrap(), r#"{"name":"b","content":[255,0]}"#);
    }
}
