//! PNG frames on disk.

use std::path::{Path, PathBuf};

use ::image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use log::debug;

use crate::acquisition::{FrameMeta, FrameSink, ImagingError};
use crate::core::{BitDepth, Frame, FrameError};

#[derive(thiserror::Error, Debug)]
pub enum FrameIoError {
    #[error(transparent)]
    Image(#[from] ::image::ImageError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("frame dimensions {width}x{height} do not fit an image")]
    TooLarge { width: usize, height: usize },
}

/// Convert a decoded image into a [`Frame`] covering `hfw` meters.
///
/// 8-bit grayscale stays 8-bit; everything else becomes 16-bit luma.
pub fn frame_from_image(img: &DynamicImage, hfw: f64) -> Result<Frame, FrameError> {
    match img {
        DynamicImage::ImageLuma8(gray) => {
            Frame::from_u8(gray.width() as usize, gray.height() as usize, hfw, gray.as_raw())
        }
        other => {
            let luma = other.to_luma16();
            Frame::new(
                luma.width() as usize,
                luma.height() as usize,
                BitDepth::Sixteen,
                hfw,
                luma.into_raw(),
            )
        }
    }
}

pub fn load_frame(path: impl AsRef<Path>, hfw: f64) -> Result<Frame, FrameIoError> {
    let img = ::image::open(path.as_ref())?;
    Ok(frame_from_image(&img, hfw)?)
}

/// Encode `frame` at its native bit depth.
pub fn frame_to_image(frame: &Frame) -> Result<DynamicImage, FrameIoError> {
    let too_large = || FrameIoError::TooLarge {
        width: frame.width(),
        height: frame.height(),
    };
    let w = u32::try_from(frame.width()).map_err(|_| too_large())?;
    let h = u32::try_from(frame.height()).map_err(|_| too_large())?;
    match frame.bit_depth() {
        BitDepth::Eight => {
            let bytes = frame.pixels().iter().map(|&v| v.min(255) as u8).collect();
            GrayImage::from_raw(w, h, bytes)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(too_large)
        }
        BitDepth::Sixteen => ImageBuffer::<Luma<u16>, _>::from_raw(w, h, frame.pixels().to_vec())
            .map(DynamicImage::ImageLuma16)
            .ok_or_else(too_large),
    }
}

pub fn save_frame(frame: &Frame, path: impl AsRef<Path>) -> Result<(), FrameIoError> {
    frame_to_image(frame)?.save(path.as_ref())?;
    Ok(())
}

/// Writes every captured frame as `tilt_<step>_ch<channel>.png`.
#[derive(Clone, Debug)]
pub struct PngDirectorySink {
    dir: PathBuf,
}

impl PngDirectorySink {
    /// Create `dir` (and parents) if needed.
    pub fn create(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, meta: &FrameMeta) -> PathBuf {
        self.dir.join(format!("tilt_{:03}_ch{}.png", meta.step, meta.channel))
    }
}

impl FrameSink for PngDirectorySink {
    fn save_frame(&mut self, frame: &Frame, meta: &FrameMeta) -> Result<(), ImagingError> {
        let path = self.path_for(meta);
        save_frame(frame, &path).map_err(|e| ImagingError::Storage(format!("{}: {e}", path.display())))?;
        debug!("saved {} ({})", path.display(), meta.angle);
        Ok(())
    }
}
