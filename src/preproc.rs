//! Page-image preprocessing.
//!
//! Two operations, both pure with respect to the filesystem (read one
//! image, write siblings next to it, no network):
//!
//! * [`binarise_multi`]: Sauvola adaptive thresholding at several `k`
//!   values. OCR quality is sensitive to `k` and the best value varies
//!   page by page, so we produce every variant and let the analyse stage
//!   keep the one that OCRed best.
//! * [`wipe`]: clear the margins of an already-binarised page, removing
//!   scanner edge noise without touching the text block.
//!
//! Both are CPU-bound; callers run them under `spawn_blocking`.

use image::{GrayImage, ImageReader, Luma};

use crate::{naming, prelude::*};

/// Sauvola window radius in pixels.
const WINDOW: u32 = 25;

/// Sauvola dynamic range of standard deviation.
const RANGE: f64 = 128.0;

/// Fraction of dark pixels above which a row or column counts as content
/// when locating the text block for [`wipe`]. Scanner edge noise rarely
/// covers more than a few percent of a line.
const INK_THRESHOLD: f64 = 0.05;

/// Binarise `path` at each threshold in `ks`, writing
/// `<stem>_bin<k>.png` siblings and returning their paths.
pub fn binarise_multi(path: &Path, ks: &[f64]) -> Result<Vec<PathBuf>> {
    let grey = load_grey(path)?;
    let integrals = Integrals::new(&grey);
    let stem = stem_of(path)?;
    let dir = path.parent().unwrap_or(Path::new(""));

    let mut outputs = Vec::with_capacity(ks.len());
    for &k in ks {
        let out = dir.join(naming::binarised_name(&stem, k));
        let binarised = sauvola(&grey, &integrals, k);
        binarised
            .save(&out)
            .with_context(|| format!("failed to write {out:?}"))?;
        outputs.push(out);
    }
    Ok(outputs)
}

/// Clear the margins of `path`, writing the result to `out`.
pub fn wipe(path: &Path, out: &Path) -> Result<()> {
    let grey = load_grey(path)?;
    let (width, height) = grey.dimensions();

    let row_ink = |y: u32| ink_fraction((0..width).map(|x| grey.get_pixel(x, y)[0]));
    let col_ink = |x: u32| ink_fraction((0..height).map(|y| grey.get_pixel(x, y)[0]));

    let top = (0..height).find(|&y| row_ink(y) > INK_THRESHOLD).unwrap_or(0);
    let bottom = (0..height)
        .rev()
        .find(|&y| row_ink(y) > INK_THRESHOLD)
        .unwrap_or(height.saturating_sub(1));
    let left = (0..width).find(|&x| col_ink(x) > INK_THRESHOLD).unwrap_or(0);
    let right = (0..width)
        .rev()
        .find(|&x| col_ink(x) > INK_THRESHOLD)
        .unwrap_or(width.saturating_sub(1));

    let mut wiped = grey;
    for y in 0..height {
        for x in 0..width {
            if y < top || y > bottom || x < left || x > right {
                wiped.put_pixel(x, y, Luma([255]));
            }
        }
    }
    wiped
        .save(out)
        .with_context(|| format!("failed to write {out:?}"))?;
    Ok(())
}

fn load_grey(path: &Path) -> Result<GrayImage> {
    // Sniff the content rather than trusting the extension; scanners lie.
    let img = ImageReader::open(path)
        .with_context(|| format!("failed to open image {path:?}"))?
        .with_guessed_format()
        .with_context(|| format!("failed to probe image {path:?}"))?
        .decode()
        .with_context(|| format!("failed to decode image {path:?}"))?;
    Ok(img.to_luma8())
}

fn stem_of(path: &Path) -> Result<String> {
    Ok(path
        .file_stem()
        .ok_or_else(|| anyhow!("image path {path:?} has no file stem"))?
        .to_string_lossy()
        .into_owned())
}

fn ink_fraction(pixels: impl Iterator<Item = u8>) -> f64 {
    let mut dark = 0usize;
    let mut total = 0usize;
    for p in pixels {
        total += 1;
        if p < 128 {
            dark += 1;
        }
    }
    if total == 0 { 0.0 } else { dark as f64 / total as f64 }
}

/// Summed-area tables over pixel values and squared values, for O(1)
/// window mean and variance.
struct Integrals {
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
    width: usize,
}

impl Integrals {
    fn new(img: &GrayImage) -> Integrals {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let mut sum = vec![0u64; (width + 1) * (height + 1)];
        let mut sq_sum = vec![0u64; (width + 1) * (height + 1)];
        let stride = width + 1;
        for y in 0..height {
            for x in 0..width {
                let v = img.get_pixel(x as u32, y as u32)[0] as u64;
                let i = (y + 1) * stride + (x + 1);
                sum[i] = v + sum[i - 1] + sum[i - stride] - sum[i - stride - 1];
                sq_sum[i] =
                    v * v + sq_sum[i - 1] + sq_sum[i - stride] - sq_sum[i - stride - 1];
            }
        }
        Integrals {
            sum,
            sq_sum,
            width,
        }
    }

    /// Mean and standard deviation over the clamped window centred on
    /// `(x, y)`.
    fn window_stats(&self, x: u32, y: u32, height: u32) -> (f64, f64) {
        let stride = self.width + 1;
        let x0 = x.saturating_sub(WINDOW) as usize;
        let y0 = y.saturating_sub(WINDOW) as usize;
        let x1 = ((x + WINDOW + 1) as usize).min(self.width);
        let y1 = ((y + WINDOW + 1) as usize).min(height as usize);
        let area = ((x1 - x0) * (y1 - y0)) as f64;

        let s = (self.sum[y1 * stride + x1] + self.sum[y0 * stride + x0])
            as f64
            - (self.sum[y0 * stride + x1] + self.sum[y1 * stride + x0]) as f64;
        let sq = (self.sq_sum[y1 * stride + x1] + self.sq_sum[y0 * stride + x0])
            as f64
            - (self.sq_sum[y0 * stride + x1] + self.sq_sum[y1 * stride + x0]) as f64;

        let mean = s / area;
        let variance = (sq / area - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }
}

/// Sauvola local thresholding: `t = m * (1 + k * (s / R - 1))`.
fn sauvola(img: &GrayImage, integrals: &Integrals, k: f64) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let (mean, std_dev) = integrals.window_stats(x, y, height);
            let threshold = mean * (1.0 + k * (std_dev / RANGE - 1.0));
            let v = if (img.get_pixel(x, y)[0] as f64) < threshold {
                0
            } else {
                255
            };
            out.put_pixel(x, y, Luma([v]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A white page with a black text block in the middle.
    fn test_page(dir: &Path) -> PathBuf {
        let mut img = GrayImage::from_pixel(200, 200, Luma([255]));
        for y in 80..120 {
            for x in 50..150 {
                img.put_pixel(x, y, Luma([10]));
            }
        }
        // A speckle of edge noise that wipe should clear.
        for y in 0..4 {
            img.put_pixel(0, y, Luma([0]));
        }
        let path = dir.join("0001.png");
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn binarise_multi_writes_one_variant_per_threshold() {
        let dir = tempfile::TempDir::new().unwrap();
        let page = test_page(dir.path());
        let outputs = binarise_multi(&page, &[0.1, 0.5]).unwrap();
        assert_eq!(
            outputs,
            [
                dir.path().join("0001_bin0.1.png"),
                dir.path().join("0001_bin0.5.png"),
            ]
        );
        for out in &outputs {
            let img = image::open(out).unwrap().to_luma8();
            // Strictly black and white.
            assert!(img.pixels().all(|p| p[0] == 0 || p[0] == 255));
            // The text block survived binarisation.
            assert_eq!(img.get_pixel(100, 100)[0], 0);
            assert_eq!(img.get_pixel(10, 10)[0], 255);
        }
    }

    #[test]
    fn wipe_clears_margins_but_keeps_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let page = test_page(dir.path());
        let out = dir.path().join("0001_bin0.0.png");
        wipe(&page, &out).unwrap();
        let img = image::open(&out).unwrap().to_luma8();
        // Edge noise is outside the detected text block and gets cleared.
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(20, 100)[0], 255);
        // Content untouched.
        assert_eq!(img.get_pixel(100, 100)[0], 10);
    }
}
