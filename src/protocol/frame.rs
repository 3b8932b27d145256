//! Length-prefixed framing.
//!
//! Request: `<len, left-justified, space-padded to width><batch><NUL>` where
//! `len` counts the batch plus the trailing NUL.
//! Reply: `<len, NUL-terminated inside the field><payload>`.

use crate::error::{LinkError, Result};

/// Frame a command batch for sending.
pub fn encode_request(batch: &str, width: usize) -> Result<Vec<u8>> {
    let declared = batch.len() + 1;
    let field = declared.to_string();
    if field.len() > width {
        return Err(LinkError::FrameTooLarge(batch.len()));
    }

    let mut frame = Vec::with_capacity(width + declared);
    frame.extend_from_slice(field.as_bytes());
    frame.resize(width, b' ');
    frame.extend_from_slice(batch.as_bytes());
    frame.push(0);
    Ok(frame)
}

/// What the reply length field announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHeader {
    /// A payload of this many bytes follows.
    Payload(usize),
    /// The field held no length; nothing follows (e.g. the engine is exiting).
    Directive(String),
}

/// Parse the reply length field, reading up to the first NUL.
pub fn parse_length_header(field: &[u8]) -> ReplyHeader {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let text = String::from_utf8_lossy(&field[..end]);
    match text.trim().parse::<usize>() {
        Ok(len) => ReplyHeader::Payload(len),
        Err(_) => ReplyHeader::Directive(text.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_counts_trailing_nul() {
        let frame = encode_request("app.defaultlambda;", 20).expect("should frame");
        assert_eq!(&frame[..20], b"19                  ");
        assert_eq!(&frame[20..frame.len() - 1], b"app.defaultlambda;");
        assert_eq!(frame.last(), Some(&0));
        assert_eq!(frame.len(), 20 + 19);
    }

    #[test]
    fn request_header_parses_back() {
        for batch in ["", "a;", "app.subnodes[1].close();app.exit;"] {
            let frame = encode_request(batch, 20).expect("should frame");
            assert_eq!(
                parse_length_header(&frame[..20]),
                ReplyHeader::Payload(batch.len() + 1)
            );
        }
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let batch = "x".repeat(100);
        assert!(matches!(
            encode_request(&batch, 2),
            Err(LinkError::FrameTooLarge(100))
        ));
    }

    #[test]
    fn reply_header_stops_at_nul() {
        let mut field = b"42".to_vec();
        field.push(0);
        field.extend_from_slice(b"garbage after nul");
        assert_eq!(parse_length_header(&field), ReplyHeader::Payload(42));
    }

    #[test]
    fn non_numeric_header_is_directive() {
        let mut field = b"exit".to_vec();
        field.resize(20, 0);
        assert_eq!(
            parse_length_header(&field),
            ReplyHeader::Directive("exit".to_string())
        );
        assert_eq!(
            parse_length_header(&[0u8; 20]),
            ReplyHeader::Directive(String::new())
        );
    }
}
