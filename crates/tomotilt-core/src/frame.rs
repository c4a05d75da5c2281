use serde::{Deserialize, Serialize};

/// Pixel depth reported by the detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    /// Largest representable pixel value.
    pub fn max_value(self) -> u16 {
        match self {
            BitDepth::Eight => u8::MAX as u16,
            BitDepth::Sixteen => u16::MAX,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
        }
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = FrameError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitDepth::Eight),
            16 => Ok(BitDepth::Sixteen),
            other => Err(FrameError::UnsupportedBitDepth(other)),
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> Self {
        depth.bits()
    }
}

/// Errors raised while building a [`Frame`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("invalid pixel buffer length (expected {expected} pixels, got {got})")]
    InvalidBuffer { expected: usize, got: usize },
    #[error("invalid frame dimensions (width={width}, height={height})")]
    InvalidDimensions { width: usize, height: usize },
    #[error("unsupported bit depth {0} (expected 8 or 16)")]
    UnsupportedBitDepth(u8),
    #[error("horizontal field width must be finite and positive, got {0}")]
    InvalidFieldWidth(f64),
}

/// Borrowed grayscale frame.
#[derive(Clone, Copy, Debug)]
pub struct FrameView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u16], // row-major, len = w*h
}

/// One captured grayscale image plus the field of view it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    width: usize,
    height: usize,
    bit_depth: BitDepth,
    /// Horizontal field width in meters.
    hfw: f64,
    data: Vec<u16>,
}

impl Frame {
    pub fn new(
        width: usize,
        height: usize,
        bit_depth: BitDepth,
        hfw: f64,
        data: Vec<u16>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }
        let expected = width * height;
        if data.len() != expected {
            return Err(FrameError::InvalidBuffer {
                expected,
                got: data.len(),
            });
        }
        if !hfw.is_finite() || hfw <= 0.0 {
            return Err(FrameError::InvalidFieldWidth(hfw));
        }
        Ok(Self {
            width,
            height,
            bit_depth,
            hfw,
            data,
        })
    }

    /// Build an 8-bit frame from a raw byte buffer.
    pub fn from_u8(width: usize, height: usize, hfw: f64, data: &[u8]) -> Result<Self, FrameError> {
        let pixels = data.iter().map(|&v| v as u16).collect();
        Self::new(width, height, BitDepth::Eight, hfw, pixels)
    }

    /// Build a frame by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(
        width: usize,
        height: usize,
        bit_depth: BitDepth,
        hfw: f64,
        mut f: impl FnMut(usize, usize) -> u16,
    ) -> Result<Self, FrameError> {
        let max = bit_depth.max_value();
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y).min(max));
            }
        }
        Self::new(width, height, bit_depth, hfw, data)
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn bit_depth(&self) -> BitDepth {
        self.bit_depth
    }

    /// Horizontal field width in meters.
    #[inline]
    pub fn hfw(&self) -> f64 {
        self.hfw
    }

    /// Meters per pixel: `hfw / width`.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.hfw / self.width as f64
    }

    #[inline]
    pub fn pixels(&self) -> &[u16] {
        &self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        self.data[y * self.width + x]
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }
}
