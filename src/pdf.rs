//! Searchable-PDF composition.
//!
//! Each page of the output PDF is the page image with an invisible text
//! layer behind it: every hOCR word is written at its bounding-box
//! position in text rendering mode 3, so the PDF looks like the scan but
//! selects and searches like born-digital text.

use std::{fs, io::Cursor};

use printpdf::{
    BuiltinFont, Mm, Op, PdfDocument, PdfPage, PdfSaveOptions, Pt, RawImage,
    TextItem, TextMatrix, TextRenderingMode, XObjectTransform,
};

use crate::{hocr, prelude::*};

/// Assumed scan resolution when sizing PDF pages from pixel dimensions.
const DPI: f32 = 300.0;

/// Maximum pixel width for colour images when `smaller` is requested.
const SMALLER_WIDTH: u32 = 1500;

const PT_PER_INCH: f32 = 72.0;
const MM_PER_INCH: f32 = 25.4;

/// An in-progress PDF, one image-plus-text-layer page at a time.
pub struct PdfComposer {
    doc: PdfDocument,
    pages: Vec<PdfPage>,
}

impl PdfComposer {
    pub fn new(title: &str) -> PdfComposer {
        PdfComposer {
            doc: PdfDocument::new(title),
            pages: Vec::new(),
        }
    }

    /// Append one page: `image` as the visible content, `hocr` as the
    /// invisible text layer. With `smaller`, the image is downscaled and
    /// re-encoded as JPEG first, which keeps colour PDFs at a sane size.
    pub fn add_page(&mut self, image: &Path, hocr: &Path, smaller: bool) -> Result<()> {
        let bytes = if smaller {
            shrink_jpeg(image)?
        } else {
            fs::read(image).with_context(|| format!("failed to read {image:?}"))?
        };
        let mut warnings = Vec::new();
        let raw = RawImage::decode_from_bytes(&bytes, &mut warnings)
            .map_err(|err| anyhow!("failed to decode {image:?}: {err}"))?;
        let (px_w, px_h) = (raw.width as f32, raw.height as f32);
        let page_w_pt = px_w / DPI * PT_PER_INCH;
        let page_h_pt = px_h / DPI * PT_PER_INCH;

        let image_id = self.doc.add_image(&raw);
        let mut ops = vec![Op::UseXobject {
            id: image_id,
            transform: XObjectTransform {
                dpi: Some(DPI),
                ..Default::default()
            },
        }];

        // hOCR coordinates are pixels from the top-left of the *source*
        // page, which may differ from this image's resolution (binarised
        // variants vs downscaled colour), so scale through the hOCR page
        // box rather than the image dimensions.
        let content = fs::read_to_string(hocr)
            .with_context(|| format!("failed to read {hocr:?}"))?;
        let (hocr_w, hocr_h) =
            hocr::page_dimensions(&content).unwrap_or((raw.width as u32, raw.height as u32));
        let scale_x = page_w_pt / hocr_w as f32;
        let scale_y = page_h_pt / hocr_h as f32;

        ops.push(Op::StartTextSection);
        ops.push(Op::SetTextRenderingMode {
            mode: TextRenderingMode::Invisible,
        });
        for word in hocr::words_with_boxes(hocr)? {
            let (x0, y0, x1, y1) = word.bbox;
            let size_pt = ((y1 - y0) as f32 * scale_y).max(1.0);
            // PDF origin is bottom-left; hOCR's is top-left.
            let x_pt = x0 as f32 * scale_x;
            let y_pt = page_h_pt - y1 as f32 * scale_y;
            ops.push(Op::SetFontSizeBuiltinFont {
                size: Pt(size_pt),
                font: BuiltinFont::TimesRoman,
            });
            ops.push(Op::SetTextMatrix {
                matrix: TextMatrix::Translate(Pt(x_pt), Pt(y_pt)),
            });
            ops.push(Op::WriteTextBuiltinFont {
                items: vec![TextItem::Text(word.text)],
                font: BuiltinFont::TimesRoman,
            });
        }
        ops.push(Op::EndTextSection);

        self.pages.push(PdfPage::new(
            Mm(page_w_pt / PT_PER_INCH * MM_PER_INCH),
            Mm(page_h_pt / PT_PER_INCH * MM_PER_INCH),
            ops,
        ));
        Ok(())
    }

    /// Number of pages added so far.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Write the document to `path`.
    pub fn save(mut self, path: &Path) -> Result<()> {
        let mut warnings = Vec::new();
        let bytes = self
            .doc
            .with_pages(self.pages)
            .save(&PdfSaveOptions::default(), &mut warnings);
        fs::write(path, bytes).with_context(|| format!("failed to write {path:?}"))?;
        Ok(())
    }
}

/// Downscale to at most [`SMALLER_WIDTH`] pixels wide and re-encode as
/// JPEG.
fn shrink_jpeg(path: &Path) -> Result<Vec<u8>> {
    let img = image::ImageReader::open(path)
        .with_context(|| format!("failed to open {path:?}"))?
        .with_guessed_format()
        .with_context(|| format!("failed to probe {path:?}"))?
        .decode()
        .with_context(|| format!("failed to decode {path:?}"))?;
    let img = if img.width() > SMALLER_WIDTH {
        let height = img.height() * SMALLER_WIDTH / img.width();
        img.resize(SMALLER_WIDTH, height, image::imageops::FilterType::Triangle)
    } else {
        img
    };
    let mut bytes = Vec::new();
    img.to_rgb8()
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
        .with_context(|| format!("failed to re-encode {path:?}"))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let img_path = dir.join("0001_bin0.2.png");
        image::GrayImage::from_pixel(100, 150, image::Luma([255]))
            .save(&img_path)
            .unwrap();
        let hocr_path = dir.join("0001_bin0.2.hocr");
        fs::write(
            &hocr_path,
            r#"<div class='ocr_page' title='bbox 0 0 100 150'>
<span class='ocrx_word' title='bbox 10 10 40 20; x_wconf 91'>hello</span>
</div>"#,
        )
        .unwrap();
        (img_path, hocr_path)
    }

    #[test]
    fn composes_a_searchable_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let (img, hocr) = fixture(dir.path());

        let mut composer = PdfComposer::new("test book");
        composer.add_page(&img, &hocr, false).unwrap();
        assert_eq!(composer.page_count(), 1);

        let out = dir.path().join("test.pdf");
        composer.save(&out).unwrap();
        let bytes = fs::read(&out).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn smaller_variant_also_composes() {
        let dir = tempfile::TempDir::new().unwrap();
        let (img, hocr) = fixture(dir.path());

        let mut composer = PdfComposer::new("test book");
        composer.add_page(&img, &hocr, true).unwrap();
        let out = dir.path().join("test.pdf");
        composer.save(&out).unwrap();
        assert!(fs::read(&out).unwrap().starts_with(b"%PDF"));
    }
}
