//! Access to projection, flat and dark frames on disk.
//!
//! A role directory holds either one single-page image per frame or a few
//! multi-page containers. Both layouts are flattened into an ordered list of
//! [`FrameRef`]s so callers never care which one they are looking at.

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView2};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

/// One frame: a page inside an image file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameRef {
    pub file: PathBuf,
    pub page: usize,
}

/// Sample type of stored pages.
///
/// Pages are always read as `f32`; the format decides how results are
/// written back. Signed and 64-bit data is handled as float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    U8,
    U16,
    U32,
    #[default]
    F32,
}

/// Frame count and per-frame size of a role directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackGeometry {
    pub frames: usize,
    pub height: usize,
    pub width: usize,
    /// Frames are stored as pages of multi-page files
    pub multipage: bool,
}

/// Reading and writing of single frames.
///
/// Implementations only provide the per-file operations; the frame-level
/// helpers are derived from them.
pub trait ImageStore: Send + Sync {
    /// Image files in `dir`, sorted by name.
    fn list_images(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Number of pages in `file`.
    fn page_count(&self, file: &Path) -> Result<usize>;

    /// `(height, width)` of the first page of `file`.
    fn dimensions(&self, file: &Path) -> Result<(usize, usize)>;

    fn read_page(&self, file: &Path, page: usize) -> Result<Array2<f32>>;

    /// Sample type of the first page of `file`.
    fn sample_format(&self, file: &Path) -> Result<SampleFormat>;

    /// Write a single-page image in `format`, creating parent directories.
    ///
    /// Integer formats round and saturate.
    fn write_image_as(&self, file: &Path, image: ArrayView2<'_, f32>, format: SampleFormat) -> Result<()>;

    /// Write a single-page 32-bit float image, creating parent directories.
    fn write_image(&self, file: &Path, image: ArrayView2<'_, f32>) -> Result<()> {
        self.write_image_as(file, image, SampleFormat::F32)
    }

    /// Read `frames` in order.
    fn read_frames<'a>(&'a self, frames: &'a [FrameRef]) -> Box<dyn Iterator<Item = Result<Array2<f32>>> + 'a> {
        Box::new(frames.iter().map(move |frame| self.read_frame(frame)))
    }

    /// Every frame of `dir` in acquisition order.
    fn frames(&self, dir: &Path) -> Result<Vec<FrameRef>> {
        let files = self.list_images(dir)?;
        let multipage = match files.first() {
            Some(first) => self.page_count(first)? > 1,
            None => false,
        };
        let mut frames = Vec::new();
        for file in files {
            let pages = if multipage { self.page_count(&file)? } else { 1 };
            frames.extend((0..pages).map(|page| FrameRef {
                file: file.clone(),
                page,
            }));
        }
        Ok(frames)
    }

    fn geometry(&self, dir: &Path) -> Result<StackGeometry> {
        let files = self.list_images(dir)?;
        let first = files
            .first()
            .with_context(|| format!("No images in {}", dir.display()))?;
        let (height, width) = self.dimensions(first)?;
        let multipage = self.page_count(first)? > 1;
        let frames = if multipage {
            files
                .iter()
                .map(|f| self.page_count(f))
                .sum::<Result<usize>>()?
        } else {
            files.len()
        };
        Ok(StackGeometry {
            frames,
            height,
            width,
            multipage,
        })
    }

    fn read_frame(&self, frame: &FrameRef) -> Result<Array2<f32>> {
        self.read_page(&frame.file, frame.page)
    }

    fn read_row(&self, frame: &FrameRef, row: usize) -> Result<Array1<f32>> {
        let image = self.read_frame(frame)?;
        if row >= image.nrows() {
            anyhow::bail!(
                "Row {} out of range for {} ({} rows)",
                row,
                frame.file.display(),
                image.nrows()
            );
        }
        Ok(image.row(row).to_owned())
    }

    /// First frame of `dir`.
    fn first_frame(&self, dir: &Path) -> Result<Array2<f32>> {
        let frames = self.frames(dir)?;
        let frame = frames
            .first()
            .with_context(|| format!("No frames in {}", dir.display()))?;
        self.read_frame(frame)
    }

    /// Last frame of `dir`.
    fn last_frame(&self, dir: &Path) -> Result<Array2<f32>> {
        let frames = self.frames(dir)?;
        let frame = frames
            .last()
            .with_context(|| format!("No frames in {}", dir.display()))?;
        self.read_frame(frame)
    }
}

/// TIFF-backed store on the local filesystem.
#[derive(Debug, Clone)]
pub struct TiffStore {
    extensions: Vec<String>,
}

impl Default for TiffStore {
    fn default() -> Self {
        Self::new(vec!["tif".to_string(), "tiff".to_string()])
    }
}

impl TiffStore {
    pub fn new(extensions: Vec<String>) -> Self {
        Self {
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn open(file: &Path) -> Result<Decoder<BufReader<File>>> {
        let reader = BufReader::new(
            File::open(file).with_context(|| format!("Failed to open {}", file.display()))?,
        );
        Decoder::new(reader).with_context(|| format!("Failed to decode {}", file.display()))
    }

    /// Write several 32-bit float pages into one multi-page file.
    pub fn write_stack(&self, file: &Path, pages: &[ArrayView2<'_, f32>]) -> Result<()> {
        self.write_stack_as(file, pages, SampleFormat::F32)
    }

    /// Write several pages in `format` into one multi-page file.
    pub fn write_stack_as(&self, file: &Path, pages: &[ArrayView2<'_, f32>], format: SampleFormat) -> Result<()> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = BufWriter::new(
            File::create(file).with_context(|| format!("Failed to create {}", file.display()))?,
        );
        let mut encoder = TiffEncoder::new(writer)?;
        for page in pages {
            let (h, w) = (page.nrows() as u32, page.ncols() as u32);
            let written = match format {
                SampleFormat::U8 => {
                    let data: Vec<u8> = page.iter().map(|&v| v.round() as u8).collect();
                    encoder.write_image::<colortype::Gray8>(w, h, &data)
                }
                SampleFormat::U16 => {
                    let data: Vec<u16> = page.iter().map(|&v| v.round() as u16).collect();
                    encoder.write_image::<colortype::Gray16>(w, h, &data)
                }
                SampleFormat::U32 => {
                    let data: Vec<u32> = page.iter().map(|&v| v.round() as u32).collect();
                    encoder.write_image::<colortype::Gray32>(w, h, &data)
                }
                SampleFormat::F32 => {
                    let data: Vec<f32> = page.iter().copied().collect();
                    encoder.write_image::<colortype::Gray32Float>(w, h, &data)
                }
            };
            written.with_context(|| format!("Failed to write {}", file.display()))?;
        }
        Ok(())
    }

    fn decode_page(decoder: &mut Decoder<BufReader<File>>, file: &Path) -> Result<Array2<f32>> {
        let (w, h) = decoder.dimensions()?;
        let pixels: Vec<f32> = match decoder.read_image()? {
            DecodingResult::U8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I8(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I16(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
            DecodingResult::F32(v) => v,
            DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
            #[allow(unreachable_patterns)]
            _ => anyhow::bail!("Unsupported sample format in {}", file.display()),
        };
        let (h, w) = (h as usize, w as usize);
        if pixels.len() != h * w {
            anyhow::bail!(
                "{} is not a single-channel image ({} samples for {}x{})",
                file.display(),
                pixels.len(),
                h,
                w
            );
        }
        Ok(Array2::from_shape_vec((h, w), pixels)?)
    }
}

/// An open file positioned at `page`.
struct OpenPages {
    file: PathBuf,
    decoder: Decoder<BufReader<File>>,
    page: usize,
    /// `page` has already been decoded
    consumed: bool,
}

impl OpenPages {
    fn open(file: &Path) -> Result<Self> {
        Ok(Self {
            file: file.to_path_buf(),
            decoder: TiffStore::open(file)?,
            page: 0,
            consumed: false,
        })
    }

    fn can_reach(&self, frame: &FrameRef) -> bool {
        self.file == frame.file && (self.page < frame.page || (self.page == frame.page && !self.consumed))
    }

    fn read(&mut self, page: usize) -> Result<Array2<f32>> {
        while self.page < page {
            if !self.decoder.more_images() {
                anyhow::bail!("{} has no page {}", self.file.display(), page);
            }
            self.decoder.next_image()?;
            self.page += 1;
            self.consumed = false;
        }
        let image = TiffStore::decode_page(&mut self.decoder, &self.file)?;
        self.consumed = true;
        Ok(image)
    }
}

/// Frames read in order, keeping the current file's decoder open so a
/// multi-page stack is walked once.
struct PageCursor<'a> {
    frames: std::slice::Iter<'a, FrameRef>,
    open: Option<OpenPages>,
}

impl Iterator for PageCursor<'_> {
    type Item = Result<Array2<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.frames.next()?;
        Some(self.read(frame))
    }
}

impl PageCursor<'_> {
    fn read(&mut self, frame: &FrameRef) -> Result<Array2<f32>> {
        let mut open = match self.open.take() {
            Some(open) if open.can_reach(frame) => open,
            _ => OpenPages::open(&frame.file)?,
        };
        let image = open.read(frame.page)?;
        self.open = Some(open);
        Ok(image)
    }
}

impl ImageStore for TiffStore {
    fn list_images(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && self.is_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn page_count(&self, file: &Path) -> Result<usize> {
        let mut decoder = Self::open(file)?;
        let mut pages = 1;
        while decoder.more_images() {
            decoder.next_image()?;
            pages += 1;
        }
        Ok(pages)
    }

    fn dimensions(&self, file: &Path) -> Result<(usize, usize)> {
        let mut decoder = Self::open(file)?;
        let (w, h) = decoder.dimensions()?;
        Ok((h as usize, w as usize))
    }

    fn read_page(&self, file: &Path, page: usize) -> Result<Array2<f32>> {
        OpenPages::open(file)?.read(page)
    }

    fn sample_format(&self, file: &Path) -> Result<SampleFormat> {
        let mut decoder = Self::open(file)?;
        let format = match decoder.read_image()? {
            DecodingResult::U8(_) => SampleFormat::U8,
            DecodingResult::U16(_) => SampleFormat::U16,
            DecodingResult::U32(_) => SampleFormat::U32,
            _ => SampleFormat::F32,
        };
        Ok(format)
    }

    fn write_image_as(&self, file: &Path, image: ArrayView2<'_, f32>, format: SampleFormat) -> Result<()> {
        self.write_stack_as(file, &[image], format)
    }

    fn read_frames<'a>(&'a self, frames: &'a [FrameRef]) -> Box<dyn Iterator<Item = Result<Array2<f32>>> + 'a> {
        Box::new(PageCursor {
            frames: frames.iter(),
            open: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn frame(value: f32) -> Array2<f32> {
        Array2::from_shape_fn((3, 5), |(y, x)| value + (y * 5 + x) as f32)
    }

    #[test]
    fn test_single_page_frames() {
        let dir = tempdir().unwrap();
        let store = TiffStore::default();
        for i in 0..3 {
            let path = dir.path().join(format!("img-{:04}.tif", i));
            store.write_image(&path, frame(i as f32 * 100.0).view()).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let frames = store.frames(dir.path()).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.page == 0));

        let geometry = store.geometry(dir.path()).unwrap();
        assert_eq!(
            geometry,
            StackGeometry { frames: 3, height: 3, width: 5, multipage: false }
        );

        let last = store.last_frame(dir.path()).unwrap();
        assert_eq!(last, frame(200.0));
    }

    #[test]
    fn test_multipage_frames() {
        let dir = tempdir().unwrap();
        let store = TiffStore::default();
        let pages: Vec<Array2<f32>> = (0..4).map(|i| frame(i as f32)).collect();
        let views: Vec<_> = pages.iter().map(|p| p.view()).collect();
        store.write_stack(&dir.path().join("stack.tif"), &views).unwrap();

        let geometry = store.geometry(dir.path()).unwrap();
        assert_eq!(geometry.frames, 4);
        assert!(geometry.multipage);

        let frames = store.frames(dir.path()).unwrap();
        assert_eq!(frames[3].page, 3);
        assert_eq!(store.read_frame(&frames[2]).unwrap(), pages[2]);

        let row = store.read_row(&frames[1], 2).unwrap();
        assert_eq!(row.to_vec(), vec![11.0, 12.0, 13.0, 14.0, 15.0]);
        assert!(store.read_row(&frames[1], 3).is_err());
    }

    #[test]
    fn test_read_frames_walks_stacks_in_order() {
        let dir = tempdir().unwrap();
        let store = TiffStore::default();
        let pages: Vec<Array2<f32>> = (0..5).map(|i| frame(i as f32 * 10.0)).collect();
        let views: Vec<_> = pages.iter().map(|p| p.view()).collect();
        store.write_stack(&dir.path().join("a.tif"), &views[..3]).unwrap();
        store.write_stack(&dir.path().join("b.tif"), &views[3..]).unwrap();

        let frames = store.frames(dir.path()).unwrap();
        assert_eq!(frames.len(), 5);
        let read: Vec<Array2<f32>> = store.read_frames(&frames).collect::<Result<_>>().unwrap();
        assert_eq!(read, pages);

        // going backwards or repeating a page reopens the file
        let shuffled = vec![frames[2].clone(), frames[0].clone(), frames[0].clone(), frames[4].clone()];
        let read: Vec<Array2<f32>> = store.read_frames(&shuffled).collect::<Result<_>>().unwrap();
        assert_eq!(read, vec![pages[2].clone(), pages[0].clone(), pages[0].clone(), pages[4].clone()]);

        let missing = vec![FrameRef { file: dir.path().join("b.tif"), page: 7 }];
        assert!(store.read_frames(&missing).next().unwrap().is_err());
    }

    #[test]
    fn test_integer_formats_round_trip_their_type() {
        let dir = tempdir().unwrap();
        let store = TiffStore::default();
        let image = ndarray::array![[-3.0f32, 1.4], [254.6, 300.0]];

        let u8_file = dir.path().join("u8.tif");
        store.write_image_as(&u8_file, image.view(), SampleFormat::U8).unwrap();
        assert_eq!(store.sample_format(&u8_file).unwrap(), SampleFormat::U8);
        assert_eq!(store.read_page(&u8_file, 0).unwrap(), ndarray::array![[0.0f32, 1.0], [255.0, 255.0]]);

        let u16_file = dir.path().join("u16.tif");
        store.write_image_as(&u16_file, image.view(), SampleFormat::U16).unwrap();
        assert_eq!(store.sample_format(&u16_file).unwrap(), SampleFormat::U16);

        let f32_file = dir.path().join("f32.tif");
        store.write_image(&f32_file, image.view()).unwrap();
        assert_eq!(store.sample_format(&f32_file).unwrap(), SampleFormat::F32);
        assert_eq!(store.read_page(&f32_file, 0).unwrap(), image);
    }

    #[test]
    fn test_extension_filter_is_case_insensitive() {
        let store = TiffStore::default();
        assert!(store.is_image(Path::new("a/b/IMG.TIF")));
        assert!(!store.is_image(Path::new("a/b/img.edf")));
    }

    #[test]
    fn test_empty_directory_geometry() {
        let dir = tempdir().unwrap();
        assert!(TiffStore::default().geometry(dir.path()).is_err());
    }
}
