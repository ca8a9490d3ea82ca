//! Searchable PDF synthesis from page images and their OCR results.

mod font;
pub mod text_layer;
mod writer;

pub use font::{PageFont, DEFAULT_FONT_CANDIDATES};
pub use text_layer::{join_line_words, plan_page, TextRun};
pub use writer::PdfWriter;
