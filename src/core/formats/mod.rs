//! Text format helpers: line-ending detection and string translation.

mod eol;
mod translate;

pub use eol::detect_file_eol;
pub use translate::{Translation, translate_string};
