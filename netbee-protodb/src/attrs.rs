//! Attribute access for element builders.

use std::collections::HashMap;

use crate::node::{CallHandlerEvent, CallHandlerInfo};
use crate::LoadError;

/// Attributes of the element currently being built, plus enough context
/// for error messages.
pub(crate) struct Attrs {
    pub element: String,
    pub line: u32,
    map: HashMap<String, String>,
}

impl Attrs {
    pub fn new(element: String, line: u32, map: HashMap<String, String>) -> Self {
        Attrs { element, line, map }
    }

    fn structural(&self, reason: String) -> LoadError {
        LoadError::Structural {
            element: self.element.clone(),
            line: self.line,
            reason,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(String::as_str)
    }

    /// Mandatory attribute; missing is a structural load failure naming
    /// the element and line.
    pub fn required(&self, name: &str) -> Result<&str, LoadError> {
        self.get(name)
            .ok_or_else(|| self.structural(format!("missing mandatory attribute '{name}'")))
    }

    pub fn number(&self, name: &str) -> Result<Option<u32>, LoadError> {
        match self.get(name) {
            None => Ok(None),
            Some(text) => Ok(Some(parse_number(text).ok_or_else(|| {
                self.structural(format!("attribute '{name}' is not a number: '{text}'"))
            })?)),
        }
    }

    pub fn required_number(&self, name: &str) -> Result<u32, LoadError> {
        let text = self.required(name)?;
        parse_number(text)
            .ok_or_else(|| self.structural(format!("attribute '{name}' is not a number: '{text}'")))
    }

    /// Numeric shape attributes (sizes, alignments) must be positive.
    pub fn positive_number(&self, name: &str) -> Result<u32, LoadError> {
        let value = self.required_number(name)?;
        if value == 0 {
            return Err(self.structural(format!("attribute '{name}' must be positive")));
        }
        Ok(value)
    }

    /// Boolean-ish attribute accepting yes/no and true/false.
    pub fn flag(&self, name: &str, default: bool) -> Result<bool, LoadError> {
        match self.get(name) {
            None => Ok(default),
            Some("yes") | Some("true") | Some("1") => Ok(true),
            Some("no") | Some("false") | Some("0") => Ok(false),
            Some(other) => {
                Err(self.structural(format!("attribute '{name}' is not a flag: '{other}'")))
            }
        }
    }

    /// `\xNN`-decoded byte payload of a string attribute.
    pub fn bytes(&self, name: &str) -> Result<Option<Vec<u8>>, LoadError> {
        match self.get(name) {
            None => Ok(None),
            Some(text) => Ok(Some(decode_escapes(text).map_err(|reason| {
                self.structural(format!("attribute '{name}': {reason}"))
            })?)),
        }
    }

    /// `callhandle` parsed as `namespace:function:event`.
    pub fn call_handler(&self) -> Result<Option<CallHandlerInfo>, LoadError> {
        let text = match self.get("callhandle") {
            None => return Ok(None),
            Some(text) => text,
        };

        let mut parts = text.split(':');
        let (namespace, function, event) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(f), Some(ev), None) => (ns, f, ev),
            _ => {
                return Err(self.structural(format!(
                    "callhandle '{text}' is not of the form namespace:function:event"
                )))
            }
        };

        let event = match event {
            "before" => CallHandlerEvent::Before,
            "after" => CallHandlerEvent::After,
            other => {
                return Err(self.structural(format!("callhandle event '{other}' is unknown")))
            }
        };

        Ok(Some(CallHandlerInfo {
            namespace: namespace.to_string(),
            function: function.to_string(),
            event,
        }))
    }
}

/// Radix-prefixed integer, as used by `size`, `mask` and friends.
pub(crate) fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        u32::from_str_radix(bin, 2).ok()
    } else {
        text.parse().ok()
    }
}

/// Decode `\xNN` escapes in an attribute payload; the decoded length is
/// what downstream code sees.
pub(crate) fn decode_escapes(text: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes().peekable();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }

        match bytes.next() {
            Some(b'x') => {
                let hi = bytes
                    .next()
                    .ok_or_else(|| "truncated \\x escape".to_string())?;
                let lo = bytes
                    .next()
                    .ok_or_else(|| "truncated \\x escape".to_string())?;
                let hex = [hi, lo];
                let text = std::str::from_utf8(&hex).map_err(|_| "malformed \\x escape")?;
                let value =
                    u8::from_str_radix(text, 16).map_err(|_| "malformed \\x escape")?;
                out.push(value);
            }
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => return Err("dangling backslash".to_string()),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_shrink_the_payload() {
        assert_eq!(decode_escapes("a\\x0d\\x0a").unwrap(), b"a\r\n");
        assert_eq!(decode_escapes("plain").unwrap(), b"plain");
    }

    #[test]
    fn numbers_accept_radix_prefixes() {
        assert_eq!(parse_number("0x0800"), Some(0x0800));
        assert_eq!(parse_number("10"), Some(10));
        assert_eq!(parse_number("0b101"), Some(5));
        assert_eq!(parse_number("jam"), None);
    }
}
