//! Integration tests for the text helpers on top of the file cache:
//! EOL detection with buffer-aware positioning and string translation.
use std::sync::Arc;

use tempfile::TempDir;

use tasktree::core::files::{CachedFile, HandlePool, OpenFlags};
use tasktree::core::formats::{detect_file_eol, translate_string};

mod common;

#[test]
fn test_detect_file_eol_round_trip() {
    common::init_logging();

    let dir = TempDir::new().unwrap();
    let pool = Arc::new(HandlePool::new(2));
    let mut file = CachedFile::open_with_pool(
        pool,
        dir.path().join("eol_probe.txt"),
        OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
        64,
        false,
    )
    .unwrap();

    let cases: &[(&[u8], Option<&str>)] = &[
        (b"Before\n", Some("\n")),
        (b"Now\r\n", Some("\r\n")),
        (b"After\r", Some("\r")),
        (b"No EOL", None),
        (b"", None),
    ];

    // Reuse one file for all cases: overwrite, truncate to the new
    // length, then detect from the start.
    for (data, expected) in cases {
        file.seek(0);
        file.write(data).unwrap();
        file.truncate().unwrap();

        file.seek(0);
        assert_eq!(
            detect_file_eol(&mut file).unwrap(),
            *expected,
            "input {:?}",
            String::from_utf8_lossy(data)
        );
    }
}

#[test]
fn test_translate_string_no_eol_is_a_no_op() {
    let translation = translate_string(b"just words", "utf-8").unwrap();
    assert_eq!(translation.text, "just words");
    assert!(!translation.translated_to_utf8);
    assert!(!translation.translated_line_endings);
}

#[test]
fn test_translate_string_normalizes_crlf() {
    let translation = translate_string(b"one\r\ntwo\r\nthree", "utf-8").unwrap();
    assert_eq!(translation.text, "one\ntwo\nthree");
    assert!(translation.translated_line_endings);
    assert!(!translation.translated_to_utf8);
}

#[test]
fn test_translate_string_latin1_to_utf8() {
    // ISO-8859-1 bytes 0xC7 0xA9 must come out as the UTF-8 sequence
    // 0xC3 0x87 0xC2 0xA9.
    let translation = translate_string(&[0xC7, 0xA9], "iso-8859-1").unwrap();
    assert_eq!(translation.text.as_bytes(), &[0xC3, 0x87, 0xC2, 0xA9]);
    assert!(translation.translated_to_utf8);
    assert!(std::str::from_utf8(translation.text.as_bytes()).is_ok());
}
