use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info};

/// Unicode-capable TrueType fonts commonly installed on macOS, Windows and
/// Linux, tried in order.
pub const DEFAULT_FONT_CANDIDATES: &[&str] = &[
    "/System/Library/Fonts/Supplemental/Arial Unicode.ttf",
    "/System/Library/Fonts/Supplemental/Arial Unicode MS.ttf",
    "/System/Library/Fonts/Supplemental/ArialUnicode.ttf",
    "/System/Library/Fonts/Supplemental/AppleGothic.ttf",
    "/Library/Fonts/AppleGothic.ttf",
    "C:/Windows/Fonts/malgun.ttf",
    "C:/Windows/Fonts/arialuni.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansCJK-Regular.ttc",
    "/usr/share/fonts/truetype/nanum/NanumGothic.ttf",
];

/// An embeddable TrueType font.
pub struct UnicodeFont {
    path: PathBuf,
    data: Vec<u8>,
    base_name: String,
    units_per_em: u16,
    ascender: i16,
    descender: i16,
    bbox: [i16; 4],
}

impl UnicodeFont {
    /// Loads a standalone `glyf`-outline TrueType file. Collections and
    /// CFF-flavoured fonts cannot be embedded as CIDFontType2.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        if ttf_parser::fonts_in_collection(&data).is_some() {
            debug!("Skipping font collection {}", path.display());
            return None;
        }
        let face = ttf_parser::Face::parse(&data, 0).ok()?;
        if face.tables().glyf.is_none() {
            debug!("Skipping {}: no TrueType outlines", path.display());
            return None;
        }
        let rect = face.global_bounding_box();
        let (units_per_em, ascender, descender) =
            (face.units_per_em(), face.ascender(), face.descender());
        let bbox = [rect.x_min, rect.y_min, rect.x_max, rect.y_max];
        let base_name: String = path
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        Some(Self {
            path: path.to_path_buf(),
            base_name: if base_name.is_empty() {
                "EmbeddedFont".to_string()
            } else {
                base_name
            },
            units_per_em,
            ascender,
            descender,
            bbox,
            data,
        })
    }

    fn face(&self) -> Option<ttf_parser::Face<'_>> {
        ttf_parser::Face::parse(&self.data, 0).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn ascent(&self) -> i64 {
        self.scale(self.ascender as i64)
    }

    pub fn descent(&self) -> i64 {
        self.scale(self.descender as i64)
    }

    pub fn bbox(&self) -> [i64; 4] {
        self.bbox.map(|v| self.scale(v as i64))
    }

    /// Font units to PDF glyph space (1/1000 em).
    fn scale(&self, units: i64) -> i64 {
        units * 1000 / i64::from(self.units_per_em.max(1))
    }

    fn glyph(&self, c: char) -> Option<u16> {
        let face = self.face()?;
        face.glyph_index(c).map(|g| g.0).filter(|g| *g != 0)
    }

    /// Advance width of a glyph in PDF glyph space.
    pub fn width(&self, glyph: u16) -> i64 {
        let advance = self
            .face()
            .and_then(|f| f.glyph_hor_advance(ttf_parser::GlyphId(glyph)))
            .unwrap_or(0);
        self.scale(advance as i64)
    }
}

/// The font the text layer is drawn with.
pub enum PageFont {
    Unicode(UnicodeFont),
    /// Helvetica, printable ASCII only.
    Latin,
}

impl PageFont {
    /// First loadable candidate, else the Latin base font.
    pub fn resolve(candidates: &[PathBuf]) -> Self {
        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            if let Some(font) = UnicodeFont::load(candidate) {
                info!("Using text layer font {}", candidate.display());
                return PageFont::Unicode(font);
            }
        }
        debug!("No Unicode font found, falling back to Helvetica");
        PageFont::Latin
    }

    fn renders(&self, c: char) -> bool {
        match self {
            PageFont::Unicode(font) => font.glyph(c).is_some(),
            PageFont::Latin => (' '..='~').contains(&c),
        }
    }

    /// Drops control characters and code points the font has no glyph for.
    pub fn filter_renderable(&self, raw: &str) -> String {
        raw.chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .filter(|c| match self {
                PageFont::Unicode(_) => c.is_whitespace() || self.renders(*c),
                PageFont::Latin => self.renders(*c),
            })
            .collect()
    }

    /// Keeps only characters that encode; other whitespace becomes a plain
    /// space when the font has one.
    pub fn strip_unsupported(&self, raw: &str) -> String {
        let space = self.renders(' ');
        raw.chars()
            .filter_map(|c| {
                if self.renders(c) {
                    Some(c)
                } else if c.is_whitespace() && space {
                    Some(' ')
                } else {
                    None
                }
            })
            .collect()
    }

    /// Encodes `text` as a `Tj` string operand, recording the glyphs used.
    /// Fails with the first character the font cannot show.
    pub fn encode(&self, text: &str, used: &mut GlyphUsage) -> Result<Vec<u8>, char> {
        match self {
            PageFont::Unicode(font) => {
                let mut out = Vec::with_capacity(text.len() * 2);
                for c in text.chars() {
                    let glyph = font.glyph(c).ok_or(c)?;
                    used.record(glyph, c);
                    out.extend_from_slice(&glyph.to_be_bytes());
                }
                Ok(out)
            }
            PageFont::Latin => text
                .chars()
                .map(|c| if self.renders(c) { Ok(c as u8) } else { Err(c) })
                .collect(),
        }
    }
}

/// Glyphs drawn so far, for widths and the ToUnicode map.
#[derive(Debug, Default)]
pub struct GlyphUsage {
    glyphs: BTreeMap<u16, char>,
}

impl GlyphUsage {
    fn record(&mut self, glyph: u16, c: char) {
        self.glyphs.entry(glyph).or_insert(c);
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, char)> + '_ {
        self.glyphs.iter().map(|(g, c)| (*g, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_filter_keeps_printable_ascii() {
        let font = PageFont::Latin;
        assert_eq!(font.filter_renderable("Tab\there 안녕 é\u{7}!"), "Tabhere  !");
    }

    #[test]
    fn test_latin_encode_rejects_non_ascii() {
        let font = PageFont::Latin;
        let mut used = GlyphUsage::default();
        assert_eq!(font.encode("Hi!", &mut used).unwrap(), b"Hi!".to_vec());
        assert_eq!(font.encode("é", &mut used), Err('é'));
        assert!(used.is_empty());
    }

    #[test]
    fn test_strip_unsupported_maps_whitespace() {
        assert_eq!(PageFont::Latin.strip_unsupported("a\tb\u{3000}c"), "a b c");
    }

    #[test]
    fn test_resolve_without_fonts_is_latin() {
        let font = PageFont::resolve(&[PathBuf::from("/nonexistent/font.ttf")]);
        assert!(matches!(font, PageFont::Latin));
    }

    #[test]
    fn test_garbage_font_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(UnicodeFont::load(&path).is_none());
        assert!(matches!(PageFont::resolve(&[path]), PageFont::Latin));
    }
}
