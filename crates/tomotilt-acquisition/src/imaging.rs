//! Frame capture and beam-shift actuation.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, BitDepth, Frame, FrameError};

/// Beam deflection in meters at the specimen.
pub type BeamShift = Vector2<f64>;

/// Detector readout size, written `"WxH"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: usize,
    pub height: usize,
}

impl Resolution {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = ImagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ImagingError::InvalidResolution(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: usize = w.trim().parse().map_err(|_| invalid())?;
        let height: usize = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ImagingError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> Self {
        r.to_string()
    }
}

/// Acquisition parameters for one capture.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub resolution: Resolution,
    /// Per-pixel dwell time in seconds.
    pub dwell_time: f64,
    pub bit_depth: BitDepth,
    /// Horizontal field width in meters.
    pub hfw: f64,
}

impl CaptureSettings {
    /// Meters per pixel along x.
    pub fn pixel_size(&self) -> f64 {
        self.hfw / self.resolution.width.max(1) as f64
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ImagingError {
    #[error("imaging hardware fault: {0}")]
    Hardware(String),
    #[error("invalid resolution {0:?} (expected \"WxH\")")]
    InvalidResolution(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to store frame: {0}")]
    Storage(String),
}

/// Microscope imaging surface.
pub trait ImagingGateway {
    fn capture_frame(&mut self, settings: &CaptureSettings) -> Result<Frame, ImagingError>;

    /// Capture `channels` synchronized detector channels.
    ///
    /// The default captures them one after another; hardware with
    /// simultaneous readout should override it.
    fn capture_channels(&mut self, settings: &CaptureSettings, channels: usize) -> Result<Vec<Frame>, ImagingError> {
        (0..channels.max(1)).map(|_| self.capture_frame(settings)).collect()
    }

    fn beam_shift(&mut self) -> Result<BeamShift, ImagingError>;
    fn set_beam_shift(&mut self, shift: BeamShift) -> Result<(), ImagingError>;
    fn working_distance(&mut self) -> Result<f64, ImagingError>;
    fn set_working_distance(&mut self, meters: f64) -> Result<(), ImagingError>;
}

/// Where a captured frame came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub step: usize,
    pub channel: usize,
    pub angle: AngularPosition,
}

/// Persistence for captured frames.
pub trait FrameSink {
    fn save_frame(&mut self, frame: &Frame, meta: &FrameMeta) -> Result<(), ImagingError>;
}

/// Shared, serialized access to an [`ImagingGateway`].
///
/// The step loop and the dithering task both write the beam shift; every
/// operation here takes the one lock, and [`nudge`](Self::nudge) performs
/// its read-modify-write under it.
pub struct BeamShiftActuator<G> {
    inner: Arc<Mutex<G>>,
}

impl<G> Clone for BeamShiftActuator<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: ImagingGateway> BeamShiftActuator<G> {
    pub fn new(gateway: G) -> Self {
        Self {
            inner: Arc::new(Mutex::new(gateway)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, G> {
        // A panicking holder cannot leave the gateway half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Result<BeamShift, ImagingError> {
        self.lock().beam_shift()
    }

    pub fn set(&self, shift: BeamShift) -> Result<(), ImagingError> {
        self.lock().set_beam_shift(shift)
    }

    /// Add `delta` to the current beam shift; returns the new value.
    pub fn nudge(&self, delta: BeamShift) -> Result<BeamShift, ImagingError> {
        let mut g = self.lock();
        let next = g.beam_shift()? + delta;
        g.set_beam_shift(next)?;
        trace!("beam shift {:+.3e}, {:+.3e}", next.x, next.y);
        Ok(next)
    }

    /// Run `f` with exclusive access to the gateway.
    pub fn with_gateway<R>(&self, f: impl FnOnce(&mut G) -> R) -> R {
        f(&mut self.lock())
    }

    /// Recover the gateway when no other handle is alive.
    pub fn into_inner(self) -> Result<G, Self> {
        match Arc::try_unwrap(self.inner) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(|e| e.into_inner())),
            Err(inner) => Err(Self { inner }),
        }
    }
}
