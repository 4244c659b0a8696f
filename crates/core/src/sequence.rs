//! Discovery of image-sequence directories and lazy frame-pair iteration.
//!
//! A directory is a sequence when it holds an `fps.txt` with a single positive
//! frame rate and an images subdirectory. Frame `k` (in file-name order) is
//! stamped `k / fps`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use ndarray::Array4;
use tracing::debug;

use crate::types::{FramePair, Normalization, TimePair};

pub const FPS_FILE: &str = "fps.txt";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Clone)]
pub struct ImageSequence {
    dir: PathBuf,
    relative_dir: PathBuf,
    fps: f64,
    frames: Vec<PathBuf>,
}

impl ImageSequence {
    /// Returns `None` when `dir` does not look like a sequence.
    pub fn open(dir: &Path, images_dir_name: &str) -> Result<Option<Self>> {
        let fps_path = dir.join(FPS_FILE);
        let images_dir = dir.join(images_dir_name);
        if !fps_path.is_file() || !images_dir.is_dir() {
            return Ok(None);
        }

        let fps = read_fps(&fps_path)?;
        let mut frames = Vec::new();
        for entry in fs::read_dir(&images_dir)
            .with_context(|| format!("Failed to read {}", images_dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && is_image_file(&path) {
                frames.push(path);
            }
        }
        frames.sort();

        Ok(Some(Self {
            dir: dir.to_path_buf(),
            relative_dir: PathBuf::new(),
            fps,
            frames,
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location relative to the discovery root (empty for the root itself).
    pub fn relative_dir(&self) -> &Path {
        &self.relative_dir
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Number of frame pairs the walker will yield.
    pub fn len(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamp(&self, k: usize) -> f64 {
        k as f64 / self.fps
    }

    pub fn walker(&self, normalization: Normalization) -> SequenceWalker<'_> {
        SequenceWalker {
            sequence: self,
            normalization,
            next: 0,
            previous: None,
        }
    }
}

fn read_fps(path: &Path) -> Result<f64> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let fps: f64 = text
        .trim()
        .parse()
        .with_context(|| format!("Invalid frame rate in {}: {:?}", path.display(), text.trim()))?;
    ensure!(
        fps.is_finite() && fps > 0.0,
        "frame rate in {} must be positive, got {fps}",
        path.display()
    );
    Ok(fps)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Lazily decodes consecutive frame pairs of one sequence.
///
/// The decoded second frame of each pair is kept and reused as the first
/// frame of the next. After an error the walker yields nothing more.
pub struct SequenceWalker<'a> {
    sequence: &'a ImageSequence,
    normalization: Normalization,
    next: usize,
    previous: Option<Array4<f32>>,
}

impl SequenceWalker<'_> {
    fn load_pair(&mut self, k: usize) -> Result<FramePair> {
        let frames = &self.sequence.frames;
        let frame0 = match self.previous.take() {
            Some(frame) => frame,
            None => decode_frame(&frames[k], &self.normalization)?,
        };
        let frame1 = decode_frame(&frames[k + 1], &self.normalization)?;
        if frame0.shape() != frame1.shape() {
            bail!(
                "frame size changes within sequence {}: {} is {}x{}, {} is {}x{}",
                self.sequence.dir.display(),
                frames[k].display(),
                frame0.shape()[3],
                frame0.shape()[2],
                frames[k + 1].display(),
                frame1.shape()[3],
                frame1.shape()[2]
            );
        }
        self.previous = Some(frame1.clone());

        let times = TimePair::new(self.sequence.timestamp(k), self.sequence.timestamp(k + 1));
        FramePair::new(frame0, frame1, times)
    }
}

impl Iterator for SequenceWalker<'_> {
    type Item = Result<FramePair>;

    fn next(&mut self) -> Option<Self::Item> {
        let k = self.next;
        if k >= self.sequence.len() {
            return None;
        }
        match self.load_pair(k) {
            Ok(pair) => {
                self.next += 1;
                Some(Ok(pair))
            }
            Err(e) => {
                self.next = self.sequence.len();
                self.previous = None;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.sequence.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SequenceWalker<'_> {}

/// Decodes an image as RGB and maps it to a normalized `[1, 3, H, W]` tensor.
pub fn decode_frame(path: &Path, normalization: &Normalization) -> Result<Array4<f32>> {
    let rgb = image::open(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?
        .to_rgb8();
    let (w, h) = rgb.dimensions();
    Ok(Array4::from_shape_fn(
        (1, 3, h as usize, w as usize),
        |(_, c, y, x)| {
            let value = rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
            value - normalization.mean[c]
        },
    ))
}

/// Every directory under `root` (inclusive), parents before children, siblings
/// in name order. Symlinked directories are not followed.
pub fn walk_directories(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                children.push(entry.path());
            }
        }
        children.sort();
        stack.extend(children.into_iter().rev());
        found.push(dir);
    }
    Ok(found)
}

/// Finds every sequence under `root`, in traversal order.
pub fn discover_sequences(root: &Path, images_dir_name: &str) -> Result<Vec<ImageSequence>> {
    let mut sequences = Vec::new();
    for dir in walk_directories(root)? {
        if let Some(mut sequence) = ImageSequence::open(&dir, images_dir_name)? {
            sequence.relative_dir = dir.strip_prefix(root).unwrap_or(&dir).to_path_buf();
            debug!(
                dir = %dir.display(),
                frames = sequence.frames.len(),
                fps = sequence.fps,
                "Discovered sequence"
            );
            sequences.push(sequence);
        }
    }
    Ok(sequences)
}

/// Recreates the directory structure of `src` under `dest`; files are not copied.
pub fn mirror_directory_tree(src: &Path, dest: &Path) -> Result<()> {
    for dir in walk_directories(src)? {
        let relative = dir.strip_prefix(src).unwrap_or(&dir);
        let target = dest.join(relative);
        fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
    }
    Ok(())
}
