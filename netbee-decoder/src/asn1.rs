//! Minimal ASN.1 TLV walker for `cfield type="asn1"` and the
//! `isasn1type` builtin. Supports the BER family: high-tag-number
//! identifiers, short/long definite lengths and (for BER/CER)
//! indefinite lengths.

use netbee_protodb::Asn1Encoding;

pub const CLASS_UNIVERSAL: u8 = 0;
pub const CLASS_APPLICATION: u8 = 1;
pub const CLASS_CONTEXT: u8 = 2;
pub const CLASS_PRIVATE: u8 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub class: u8,
    pub constructed: bool,
    pub tag: u32,
    /// Bytes the identifier occupies.
    pub len: usize,
}

/// Decode the identifier octets at the head of `bytes`.
pub fn identifier(bytes: &[u8]) -> Option<Identifier> {
    let first = *bytes.first()?;
    let class = first >> 6;
    let constructed = first & 0x20 != 0;
    let low = first & 0x1F;

    if low != 0x1F {
        return Some(Identifier {
            class,
            constructed,
            tag: low as u32,
            len: 1,
        });
    }

    // High-tag-number form: base-128 continuation bytes.
    let mut tag: u32 = 0;
    for (i, b) in bytes.iter().enumerate().skip(1) {
        if i > 5 {
            return None;
        }
        tag = (tag << 7) | (*b & 0x7F) as u32;
        if b & 0x80 == 0 {
            return Some(Identifier {
                class,
                constructed,
                tag,
                len: i + 1,
            });
        }
    }
    None
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: Identifier,
    /// None means indefinite length (content runs to an end-of-contents
    /// marker).
    pub content_len: Option<usize>,
    /// Bytes of identifier plus length octets.
    pub header_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Asn1Error {
    Truncated,
    /// Length form not allowed by the declared encoding.
    BadLength,
    BadIdentifier,
}

/// Decode identifier and length octets of one TLV.
pub fn header(bytes: &[u8], encoding: Asn1Encoding) -> Result<Header, Asn1Error> {
    let id = identifier(bytes).ok_or(Asn1Error::BadIdentifier)?;
    let rest = &bytes[id.len..];
    let first = *rest.first().ok_or(Asn1Error::Truncated)?;

    if first & 0x80 == 0 {
        return Ok(Header {
            id,
            content_len: Some(first as usize),
            header_len: id.len + 1,
        });
    }

    let count = (first & 0x7F) as usize;
    if count == 0 {
        // Indefinite form; DER requires definite lengths.
        if encoding == Asn1Encoding::Der || !id.constructed {
            return Err(Asn1Error::BadLength);
        }
        return Ok(Header {
            id,
            content_len: None,
            header_len: id.len + 1,
        });
    }

    if count > 4 || rest.len() < 1 + count {
        return Err(Asn1Error::BadLength);
    }
    let mut len = 0usize;
    for b in &rest[1..1 + count] {
        len = (len << 8) | *b as usize;
    }
    Ok(Header {
        id,
        content_len: Some(len),
        header_len: id.len + 1 + count,
    })
}

/// Human label of a universal tag, for show strings.
pub fn tag_name(id: &Identifier) -> &'static str {
    if id.class != CLASS_UNIVERSAL {
        return match id.class {
            CLASS_APPLICATION => "application",
            CLASS_CONTEXT => "context",
            CLASS_PRIVATE => "private",
            _ => "unknown",
        };
    }
    match id.tag {
        1 => "boolean",
        2 => "integer",
        3 => "bitstring",
        4 => "octetstring",
        5 => "null",
        6 => "oid",
        12 => "utf8string",
        16 => "sequence",
        17 => "set",
        19 => "printablestring",
        23 => "utctime",
        _ => "universal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_sequence() {
        // SEQUENCE (0x30), length 3.
        let h = header(&[0x30, 0x03, 1, 2, 3], Asn1Encoding::Der).unwrap();
        assert_eq!(h.id.tag, 16);
        assert!(h.id.constructed);
        assert_eq!(h.content_len, Some(3));
        assert_eq!(h.header_len, 2);
    }

    #[test]
    fn long_form_length() {
        let h = header(&[0x04, 0x82, 0x01, 0x00], Asn1Encoding::Der).unwrap();
        assert_eq!(h.content_len, Some(256));
        assert_eq!(h.header_len, 4);
    }

    #[test]
    fn high_tag_number() {
        // Context class, tag 200 via continuation bytes.
        let id = identifier(&[0xBF, 0x81, 0x48, 0x00]).unwrap();
        assert_eq!(id.class, CLASS_CONTEXT);
        assert_eq!(id.tag, 200);
        assert_eq!(id.len, 3);
    }

    #[test]
    fn der_rejects_indefinite_lengths() {
        assert_eq!(
            header(&[0x30, 0x80, 0x00, 0x00], Asn1Encoding::Der),
            Err(Asn1Error::BadLength)
        );
        assert!(header(&[0x30, 0x80, 0x00, 0x00], Asn1Encoding::Ber).is_ok());
    }
}
