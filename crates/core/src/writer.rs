use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::assembler::AssembledFrame;

pub const DEFAULT_IMAGES_DIR: &str = "imgs";
pub const DEFAULT_TIMESTAMPS_FILE: &str = "timestamps.txt";

/// Destination for the assembled frames of one sequence.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &AssembledFrame) -> Result<()>;
    fn finish(&mut self, timestamps: &[f64]) -> Result<()>;
}

/// Writes `<dir>/imgs/%08d.png` per frame and `<dir>/timestamps.txt` at the end.
#[derive(Debug)]
pub struct SequenceWriter {
    images_dir: PathBuf,
    timestamps_path: PathBuf,
    written: usize,
}

impl SequenceWriter {
    pub fn create(dir: &Path, images_dir_name: &str, timestamps_file_name: &str) -> Result<Self> {
        let images_dir = dir.join(images_dir_name);
        fs::create_dir_all(&images_dir).with_context(|| {
            format!("Failed to create image directory {}", images_dir.display())
        })?;
        Ok(Self {
            images_dir,
            timestamps_path: dir.join(timestamps_file_name),
            written: 0,
        })
    }

    pub fn frame_path(&self, index: usize) -> PathBuf {
        self.images_dir.join(format!("{index:08}.png"))
    }

    pub fn frames_written(&self) -> usize {
        self.written
    }
}

impl FrameSink for SequenceWriter {
    fn write_frame(&mut self, frame: &AssembledFrame) -> Result<()> {
        let path = self.frame_path(frame.index);
        frame
            .image
            .save(&path)
            .with_context(|| format!("Failed to write frame {}", path.display()))?;
        self.written += 1;
        Ok(())
    }

    fn finish(&mut self, timestamps: &[f64]) -> Result<()> {
        let file = File::create(&self.timestamps_path).with_context(|| {
            format!("Failed to create {}", self.timestamps_path.display())
        })?;
        let mut out = BufWriter::new(file);
        for timestamp in timestamps {
            writeln!(out, "{timestamp:?}")?;
        }
        out.flush()?;
        debug!(
            path = %self.timestamps_path.display(),
            frames = self.written,
            "Wrote timestamp log"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn writes_zero_padded_frames_and_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer =
            SequenceWriter::create(tmp.path(), DEFAULT_IMAGES_DIR, DEFAULT_TIMESTAMPS_FILE)
                .unwrap();
        for index in 0..3 {
            writer
                .write_frame(&AssembledFrame {
                    index,
                    timestamp: index as f64 * 0.5,
                    image: GrayImage::from_pixel(4, 2, image::Luma([index as u8 * 10])),
                })
                .unwrap();
        }
        writer.finish(&[0.0, 0.5, 1.0]).unwrap();

        assert_eq!(writer.frames_written(), 3);
        let second = tmp.path().join("imgs").join("00000001.png");
        let decoded = image::open(&second).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 2));
        assert_eq!(decoded.get_pixel(3, 1)[0], 10);

        let log = fs::read_to_string(tmp.path().join("timestamps.txt")).unwrap();
        assert_eq!(log, "0.0\n0.5\n1.0\n");
    }

    #[test]
    fn frame_path_uses_eight_digits() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = SequenceWriter::create(tmp.path(), "frames", "ts.txt").unwrap();
        assert!(writer.frame_path(123).ends_with("frames/00000123.png"));
    }
}
