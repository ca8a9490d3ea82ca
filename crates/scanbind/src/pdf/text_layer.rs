//! Layout of the invisible text layer drawn over a page image.
//!
//! Everything here is pure geometry and string handling; the writer turns
//! the resulting [`TextRun`]s into content-stream operators.

use std::sync::LazyLock;

use regex::Regex;

use crate::ocr::OcrWord;

/// Leading punctuation: any Unicode punctuation category plus a few
/// symbols OCR tends to split off as separate tokens.
static LEADING_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\p{P}·~%)\]}>]").unwrap());

/// Any line terminator (`\R`).
static LINE_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r\n|[\n\x0B\x0C\r\x{85}\x{2028}\x{2029}]").unwrap());

const OPENING_CHARS: &[char] = &['(', '[', '{', '<', '"', '\'', '“', '‘'];

const HANGUL_PARTICLES: &[&str] = &[
    "은", "는", "이", "가", "을", "를", "의", "에", "도", "와", "과", "로", "만", "께", "랑", "나",
    "야", "요", "께서", "에서", "에게", "부터", "까지", "처럼", "보다", "으로", "라도", "이나",
    "이며", "인데", "이다",
];

/// A single positioned string in PDF user space (origin bottom-left).
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub font_size: f32,
}

/// Words clustered onto one visual line.
#[derive(Debug, Clone)]
pub struct TextLine {
    words: Vec<OcrWord>,
    min_x: f32,
    min_y: f32,
    max_x: f32,
    max_y: f32,
}

impl TextLine {
    fn from_word(word: OcrWord) -> Self {
        Self {
            min_x: word.min_x,
            min_y: word.min_y,
            max_x: word.max_x,
            max_y: word.max_y,
            words: vec![word],
        }
    }

    fn add(&mut self, word: OcrWord) {
        self.min_x = self.min_x.min(word.min_x);
        self.min_y = self.min_y.min(word.min_y);
        self.max_x = self.max_x.max(word.max_x);
        self.max_y = self.max_y.max(word.max_y);
        self.words.push(word);
    }

    pub fn words(&self) -> &[OcrWord] {
        &self.words
    }

    pub fn min_x(&self) -> f32 {
        self.min_x
    }

    pub fn max_x(&self) -> f32 {
        self.max_x
    }

    pub fn max_y(&self) -> f32 {
        self.max_y
    }

    pub fn height(&self) -> f32 {
        (self.max_y - self.min_y).max(1.0)
    }

    pub fn center_y(&self) -> f32 {
        (self.min_y + self.max_y) / 2.0
    }

    pub fn text(&self) -> String {
        join_line_words(&self.words)
    }
}

fn median_height<'a>(words: impl Iterator<Item = &'a OcrWord>) -> Option<f32> {
    let mut heights: Vec<f32> = words.map(OcrWord::height).collect();
    if heights.is_empty() {
        return None;
    }
    heights.sort_by(f32::total_cmp);
    Some(heights[heights.len() / 2])
}

/// Groups words into lines by vertical center.
///
/// Words are visited top to bottom, left to right, and each joins the
/// nearest line whose center lies within the threshold; words with blank
/// text are ignored.
pub fn build_lines(words: &[OcrWord]) -> Vec<TextLine> {
    let mut filtered: Vec<OcrWord> = words
        .iter()
        .filter(|w| !w.text.trim().is_empty())
        .cloned()
        .collect();
    let Some(median) = median_height(filtered.iter()) else {
        return Vec::new();
    };
    filtered.sort_by(|a, b| {
        a.center_y()
            .total_cmp(&b.center_y())
            .then_with(|| a.min_x.total_cmp(&b.min_x))
    });
    let threshold = (median * 0.65).max(3.0);

    let mut lines: Vec<TextLine> = Vec::new();
    for word in filtered {
        let center = word.center_y();
        let best = lines
            .iter()
            .enumerate()
            .map(|(i, line)| (i, (center - line.center_y()).abs()))
            .filter(|(_, diff)| *diff <= threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i);
        match best {
            Some(i) => lines[i].add(word),
            None => lines.push(TextLine::from_word(word)),
        }
    }

    for line in &mut lines {
        line.words.sort_by(|a, b| a.min_x.total_cmp(&b.min_x));
    }
    lines.sort_by(|a, b| {
        a.center_y()
            .total_cmp(&b.center_y())
            .then_with(|| a.min_x.total_cmp(&b.min_x))
    });
    lines
}

fn starts_with_punctuation(token: &str) -> bool {
    LEADING_PUNCTUATION.is_match(token)
}

fn ends_with_opening(buffer: &str) -> bool {
    buffer.chars().last().is_some_and(|c| OPENING_CHARS.contains(&c))
}

fn is_hangul_token(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| ('\u{AC00}'..='\u{D7A3}').contains(&c))
}

fn attaches_as_particle(prev: &str, token: &str) -> bool {
    is_hangul_token(prev)
        && is_hangul_token(token)
        && token.chars().count() <= 2
        && HANGUL_PARTICLES.contains(&token)
}

/// Joins the words of one line, separated by single spaces except before
/// punctuation, after an opening bracket or quote, and before a Korean
/// particle that follows a Hangul word.
pub fn join_line_words(words: &[OcrWord]) -> String {
    let mut out = String::new();
    let mut prev = "";
    for word in words {
        let token = word.text.trim();
        if token.is_empty() {
            continue;
        }
        if !out.is_empty()
            && !starts_with_punctuation(token)
            && !ends_with_opening(&out)
            && !attaches_as_particle(prev, token)
        {
            out.push(' ');
        }
        out.push_str(token);
        prev = token;
    }
    out
}

/// Non-blank lines of the full OCR text, trimmed, with no-break spaces
/// turned into plain ones.
pub fn canonical_lines(full_text: &str) -> Vec<String> {
    LINE_BREAK
        .split(full_text)
        .map(|line| line.replace('\u{00A0}', " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Font size for the block fallback: median word height, or a
/// page-relative default when no words exist.
pub fn estimate_block_font_size(words: &[OcrWord], page_height: f32) -> f32 {
    match median_height(words.iter()) {
        Some(median) => median.clamp(8.0, 22.0),
        None => (page_height / 120.0).clamp(8.0, 14.0),
    }
}

fn clamp_to_page(value: f32, extent: f32) -> f32 {
    value.min(extent - 1.0).max(0.0)
}

/// Plans every text run of a page.
///
/// Positioned word lines are preferred; when no line can be built the
/// full text is stacked from the top of the page; with neither the page
/// gets no text layer.
pub fn plan_page(words: &[OcrWord], full_text: &str, width: f32, height: f32) -> Vec<TextRun> {
    let lines = build_lines(words);
    if !lines.is_empty() {
        return lines
            .iter()
            .map(|line| TextRun {
                text: line.text(),
                x: clamp_to_page(line.min_x(), width),
                y: clamp_to_page(height - line.max_y(), height),
                font_size: line.height().clamp(4.0, 64.0),
            })
            .collect();
    }

    let block = canonical_lines(full_text);
    if block.is_empty() {
        return Vec::new();
    }

    let font_size = estimate_block_font_size(words, height);
    let leading = (font_size * 1.25).max(9.0);
    let x = clamp_to_page(1.0, width);
    let mut y = (height - 10.0).max(10.0);
    let mut runs = Vec::with_capacity(block.len());
    for text in block {
        runs.push(TextRun {
            text,
            x,
            y,
            font_size,
        });
        y -= leading;
        if y < 2.0 {
            break;
        }
    }
    runs
}
