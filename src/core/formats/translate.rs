//! String translation: charset decoding and line-ending normalization.
use encoding_rs::Encoding;

use crate::Result;
use crate::error::TaskTreeError;

/// Result of translating a byte string to UTF-8 with normalized line
/// endings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The translated text.
    pub text: String,
    /// Whether re-encoding changed any byte. `false` means the input
    /// already was the corresponding UTF-8.
    pub translated_to_utf8: bool,
    /// Whether any CRLF or CR line ending was rewritten to LF.
    pub translated_line_endings: bool,
}

/// Decode `input` from `charset` to UTF-8 and normalize CRLF and CR
/// line endings to LF.
///
/// `charset` accepts WHATWG encoding labels ("utf-8", "iso-8859-1",
/// "windows-1252", ...). Undecodable byte sequences are replaced, the
/// way lenient decoders do.
///
/// # Examples
///
/// ```rust
/// use tasktree::core::formats::translate_string;
///
/// let translation = translate_string(b"plain text", "utf-8").unwrap();
/// assert_eq!(translation.text, "plain text");
/// assert!(!translation.translated_to_utf8);
/// assert!(!translation.translated_line_endings);
/// ```
pub fn translate_string(input: &[u8], charset: &str) -> Result<Translation> {
    let encoding = Encoding::for_label(charset.as_bytes())
        .ok_or_else(|| TaskTreeError::UnsupportedEncoding(charset.to_string()))?;

    let (decoded, _, _) = encoding.decode(input);
    let translated_to_utf8 = decoded.as_bytes() != input;

    let (text, translated_line_endings) = normalize_line_endings(decoded.into_owned());

    Ok(Translation {
        text,
        translated_to_utf8,
        translated_line_endings,
    })
}

fn normalize_line_endings(text: String) -> (String, bool) {
    if !text.contains('\r') {
        return (text, false);
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    (normalized, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"no eol at all", false ; "plain ascii")]
    #[test_case(b"unix\nonly\n", false ; "lf stays")]
    #[test_case(b"dos\r\nstyle", true ; "crlf converts")]
    #[test_case(b"old\rmac", true ; "cr converts")]
    fn test_line_ending_flag(input: &[u8], expect_translated: bool) {
        let translation = translate_string(input, "utf-8").unwrap();
        assert_eq!(translation.translated_line_endings, expect_translated);
        assert!(!translation.text.contains('\r'));
    }

    #[test]
    fn test_utf8_input_is_a_no_op() {
        let translation = translate_string("schön".as_bytes(), "utf-8").unwrap();
        assert_eq!(translation.text, "schön");
        assert!(!translation.translated_to_utf8);
    }

    #[test]
    fn test_latin1_bytes_become_valid_utf8() {
        // 0xC7 0xA9 in ISO-8859-1 is "Ç©"; as UTF-8 that is
        // 0xC3 0x87 0xC2 0xA9.
        let translation = translate_string(&[0xC7, 0xA9], "iso-8859-1").unwrap();
        assert_eq!(translation.text.as_bytes(), &[0xC3, 0x87, 0xC2, 0xA9]);
        assert!(translation.translated_to_utf8);
        assert!(!translation.translated_line_endings);
    }

    #[test]
    fn test_crlf_and_charset_together() {
        let translation = translate_string(&[0xC7, b'\r', b'\n', 0xA9], "iso-8859-1").unwrap();
        assert_eq!(translation.text, "Ç\n©");
        assert!(translation.translated_to_utf8);
        assert!(translation.translated_line_endings);
    }

    #[test]
    fn test_unknown_charset_is_rejected() {
        let err = translate_string(b"x", "no-such-charset").unwrap_err();
        assert!(matches!(err, TaskTreeError::UnsupportedEncoding(_)));
    }
}
