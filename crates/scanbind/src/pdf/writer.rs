use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use image::{ColorType, GenericImageView, ImageFormat};
use log::{debug, info, warn};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use crate::error::PdfError;
use crate::ocr::OcrPageResult;
use crate::pdf::font::{GlyphUsage, PageFont, UnicodeFont, DEFAULT_FONT_CANDIDATES};
use crate::pdf::text_layer::{plan_page, TextRun};

const FONT_RESOURCE: &str = "F1";

/// Builds searchable PDFs: each page image drawn full-page with an
/// invisible text layer on top.
#[derive(Debug, Clone)]
pub struct PdfWriter {
    font_candidates: Vec<PathBuf>,
}

impl Default for PdfWriter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PdfWriter {
    /// `extra_fonts` are tried before the built-in OS font list.
    pub fn new(extra_fonts: Vec<PathBuf>) -> Self {
        let mut font_candidates = extra_fonts;
        font_candidates.extend(DEFAULT_FONT_CANDIDATES.iter().map(PathBuf::from));
        Self { font_candidates }
    }

    /// Writes one page per OCR result, in order, to `output`.
    pub fn write_searchable_pdf(
        &self,
        pages: &[OcrPageResult],
        output: &Path,
    ) -> Result<PathBuf, PdfError> {
        let _span = tracing::info_span!("pdf.write", pages = pages.len()).entered();

        if pages.is_empty() {
            return Err(PdfError::NoPages);
        }

        let font = PageFont::resolve(&self.font_candidates);
        let mut doc = Document::with_version("1.7");
        let pages_id = doc.new_object_id();
        let font_id = doc.new_object_id();
        let mut usage = GlyphUsage::default();
        let mut kids: Vec<Object> = Vec::with_capacity(pages.len());

        for (index, page) in pages.iter().enumerate() {
            let page_id = add_page(&mut doc, pages_id, font_id, &font, &mut usage, index, page)?;
            kids.push(page_id.into());
        }

        let font_dict = match &font {
            PageFont::Unicode(unicode) => unicode_font_object(&mut doc, unicode, &usage)?,
            PageFont::Latin => Object::Dictionary(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => "Helvetica",
                "Encoding" => "WinAnsiEncoding",
            }),
        };
        doc.objects.insert(font_id, font_dict);

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer)
            .map_err(|e| PdfError::Pdf(e.to_string()))?;
        write_atomically(output, &buffer)?;

        info!("Wrote {} pages to {}", pages.len(), output.display());
        Ok(output.to_path_buf())
    }
}

fn write_atomically(output: &Path, bytes: &[u8]) -> Result<(), PdfError> {
    let io_err = |source| PdfError::Io {
        path: output.to_path_buf(),
        source,
    };
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let partial = output.with_extension("pdf.part");
    std::fs::write(&partial, bytes).map_err(io_err)?;
    std::fs::rename(&partial, output).map_err(io_err)
}

fn add_page(
    doc: &mut Document,
    pages_id: ObjectId,
    font_id: ObjectId,
    font: &PageFont,
    usage: &mut GlyphUsage,
    index: usize,
    page: &OcrPageResult,
) -> Result<ObjectId, PdfError> {
    let (image_stream, width, height) = image_xobject(&page.image_path)?;
    let image_id = doc.add_object(image_stream);
    let image_name = format!("Im{}", index + 1);

    let mut content = format!(
        "q\n{} 0 0 {} 0 0 cm\n/{} Do\nQ\n",
        width, height, image_name
    );
    let runs = plan_page(&page.words, &page.full_text, width as f32, height as f32);
    let drawn = write_text_layer(&mut content, font, usage, &runs);
    debug!(
        "Page {} ({}): {} of {} text runs drawn",
        index,
        page.image_path.display(),
        drawn,
        runs.len()
    );

    let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), (width as i64).into(), (height as i64).into()],
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                image_name.as_str() => image_id,
            },
            "Font" => dictionary! {
                FONT_RESOURCE => font_id,
            },
        },
        "Contents" => content_id,
    });
    Ok(page_id)
}

/// Appends invisible text operators for every run that survives filtering.
/// A run the font cannot encode is re-filtered once and otherwise skipped.
fn write_text_layer(
    content: &mut String,
    font: &PageFont,
    usage: &mut GlyphUsage,
    runs: &[TextRun],
) -> usize {
    let mut drawn = 0;
    for run in runs {
        let safe = font.filter_renderable(&run.text);
        if safe.trim().is_empty() {
            continue;
        }
        let encoded = match font.encode(&safe, usage) {
            Ok(bytes) => bytes,
            Err(c) => {
                debug!("Re-filtering text run after unencodable {:?}", c);
                let repaired = font.strip_unsupported(&safe);
                if repaired.trim().is_empty() {
                    continue;
                }
                match font.encode(&repaired, usage) {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            }
        };
        let _ = write!(
            content,
            "BT\n3 Tr\n/{} {:.2} Tf\n{:.2} {:.2} Td\n{} Tj\nET\n",
            FONT_RESOURCE,
            run.font_size,
            run.x,
            run.y,
            string_operand(font, encoded)
        );
        drawn += 1;
    }
    drawn
}

fn string_operand(font: &PageFont, bytes: Vec<u8>) -> String {
    match font {
        PageFont::Unicode(_) => {
            let hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
            format!("<{}>", hex)
        }
        PageFont::Latin => {
            let mut out = String::with_capacity(bytes.len() + 2);
            out.push('(');
            for b in bytes {
                if matches!(b, b'(' | b')' | b'\\') {
                    out.push('\\');
                }
                out.push(b as char);
            }
            out.push(')');
            out
        }
    }
}

/// Image XObject for a page plus its pixel size.
///
/// Gray and RGB JPEGs are embedded untouched; everything else is decoded
/// and re-encoded as Flate-compressed RGB.
fn image_xobject(path: &Path) -> Result<(Stream, u32, u32), PdfError> {
    let read_err = |reason: String| PdfError::ImageRead {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = std::fs::read(path).map_err(|e| read_err(e.to_string()))?;
    let img = image::load_from_memory(&bytes).map_err(|e| read_err(e.to_string()))?;
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(read_err("image has no pixels".to_string()));
    }

    let passthrough_space = match (image::guess_format(&bytes), img.color()) {
        (Ok(ImageFormat::Jpeg), ColorType::L8) => Some("DeviceGray"),
        (Ok(ImageFormat::Jpeg), ColorType::Rgb8) => Some("DeviceRGB"),
        _ => None,
    };

    let stream = match passthrough_space {
        Some(color_space) => Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => color_space,
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            bytes,
        )
        // Already compressed.
        .with_compression(false),
        None => {
            let mut stream = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => width as i64,
                    "Height" => height as i64,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                },
                img.to_rgb8().into_raw(),
            );
            if let Err(e) = stream.compress() {
                warn!("Leaving image {} uncompressed: {}", path.display(), e);
            }
            stream
        }
    };
    Ok((stream, width, height))
}

/// Type0 font over an embedded CIDFontType2 with Identity-H encoding.
fn unicode_font_object(
    doc: &mut Document,
    font: &UnicodeFont,
    usage: &GlyphUsage,
) -> Result<Object, PdfError> {
    let mut file = Stream::new(
        dictionary! { "Length1" => font.data().len() as i64 },
        font.data().to_vec(),
    );
    file.compress()
        .map_err(|e| PdfError::Pdf(format!("font {}: {}", font.path().display(), e)))?;
    let file_id = doc.add_object(file);

    let bbox: Vec<Object> = font.bbox().iter().map(|v| (*v).into()).collect();
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => Object::Name(font.base_name().as_bytes().to_vec()),
        "Flags" => 32,
        "FontBBox" => bbox,
        "ItalicAngle" => 0,
        "Ascent" => font.ascent(),
        "Descent" => font.descent(),
        "CapHeight" => font.ascent(),
        "StemV" => 80,
        "FontFile2" => file_id,
    });

    let mut widths: Vec<Object> = Vec::new();
    for (glyph, _) in usage.iter() {
        widths.push(i64::from(glyph).into());
        widths.push(Object::Array(vec![font.width(glyph).into()]));
    }

    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => Object::Name(font.base_name().as_bytes().to_vec()),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => 1000,
        "W" => widths,
        "CIDToGIDMap" => "Identity",
    });

    let to_unicode_id = doc.add_object(Stream::new(dictionary! {}, to_unicode_cmap(usage).into_bytes()));

    Ok(Object::Dictionary(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => Object::Name(font.base_name().as_bytes().to_vec()),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![cid_font_id.into()],
        "ToUnicode" => to_unicode_id,
    }))
}

/// CMap mapping every used glyph id back to its character.
pub(crate) fn to_unicode_cmap(usage: &GlyphUsage) -> String {
    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n12 dict begin\nbegincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n/CMapType 2 def\n\
         1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n",
    );
    let entries: Vec<(u16, char)> = usage.iter().collect();
    for chunk in entries.chunks(100) {
        let _ = writeln!(cmap, "{} beginbfchar", chunk.len());
        for (glyph, c) in chunk {
            let mut units = [0u16; 2];
            let utf16: String = c
                .encode_utf16(&mut units)
                .iter()
                .map(|u| format!("{:04X}", u))
                .collect();
            let _ = writeln!(cmap, "<{:04X}> <{}>", glyph, utf16);
        }
        cmap.push_str("endbfchar\n");
    }
    cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    cmap
}
