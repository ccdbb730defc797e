//! Line-ending detection on cached files.
use crate::Result;
use crate::core::files::CachedFile;

/// Detect the first line ending in `file`, scanning from the current
/// position.
///
/// Returns `"\n"`, `"\r\n"`, or `"\r"`, or `None` for a file without
/// any line ending. The file position is restored afterwards.
pub fn detect_file_eol(file: &mut CachedFile) -> Result<Option<&'static str>> {
    let saved = file.position();
    let result = scan(file);
    file.seek(saved);
    result
}

fn scan(file: &mut CachedFile) -> Result<Option<&'static str>> {
    loop {
        if file.at_eof()? {
            return Ok(None);
        }
        match file.getc()? {
            b'\n' => return Ok(Some("\n")),
            b'\r' => {
                // A trailing bare CR counts as the old-Mac style.
                if file.at_eof()? {
                    return Ok(Some("\r"));
                }
                let next = file.getc()?;
                return Ok(if next == b'\n' { Some("\r\n") } else { Some("\r") });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::files::{HandlePool, OpenFlags};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_position_is_restored() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(HandlePool::new(2));
        let mut file = CachedFile::open_with_pool(
            pool,
            dir.path().join("eol.txt"),
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            64,
            false,
        )
        .unwrap();

        file.write(b"line one\nline two\n").unwrap();
        file.seek(3);
        assert_eq!(detect_file_eol(&mut file).unwrap(), Some("\n"));
        assert_eq!(file.position(), 3);
    }

    #[test]
    fn test_detects_crlf_across_getc_calls() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(HandlePool::new(2));
        let mut file = CachedFile::open_with_pool(
            pool,
            dir.path().join("eol.txt"),
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            64,
            false,
        )
        .unwrap();

        file.write(b"dos style\r\nrest").unwrap();
        file.seek(0);
        assert_eq!(detect_file_eol(&mut file).unwrap(), Some("\r\n"));
    }
}
