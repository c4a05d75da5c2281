//! Simulated stage and microscope.
//!
//! The stage and the microscope share one [`SimulatedStage`], so moving the
//! specimen changes what the microscope sees. The imaged point sits
//! `y_eff = stage_y − axis_y`, `z_eff = stage_z − axis_z` away from the
//! rotation axis; tilting to `θ` displaces it along the image `y` axis by
//! `y_eff·(1 − cos θ) + z_eff·sin θ`. The beam shift displaces the image
//! content opposite to its sign, so a correction of `−displacement` puts
//! the content back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tomotilt_core::{AngularPosition, Frame, LinearPosition};

use crate::clock::ManualClock;
use crate::imaging::{BeamShift, CaptureSettings, FrameMeta, FrameSink, ImagingError, ImagingGateway};
use crate::positioner::{Axis, AxisLimits, BoundedPositioner, DriverError, PositionerDriver};

#[derive(Debug, Default)]
struct StageState {
    positions: [i64; 5],
    axis_y: f64,
    axis_z: f64,
    settle_polls: usize,
    polls_left: usize,
    moves: usize,
    fail_after_moves: Option<usize>,
    unreadable: Option<Axis>,
}

/// Shared mechanical state of the simulated specimen stage.
#[derive(Clone, Debug, Default)]
pub struct SimulatedStage {
    inner: Arc<Mutex<StageState>>,
}

impl SimulatedStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StageState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Place the imaged point `(y, z)` meters away from the rotation axis.
    pub fn with_eucentric_offset(self, y: f64, z: f64) -> Self {
        {
            let mut s = self.lock();
            let stage_y = LinearPosition(s.positions[Axis::Y.index()]).meters();
            let stage_z = LinearPosition(s.positions[Axis::Z.index()]).meters();
            s.axis_y = stage_y - y;
            s.axis_z = stage_z - z;
        }
        self
    }

    /// Number of `is_moving` polls that report motion after each command.
    pub fn with_settle_polls(self, polls: usize) -> Self {
        self.lock().settle_polls = polls;
        self
    }

    /// Fail every command after the first `moves` ones.
    pub fn fail_after_moves(&self, moves: usize) {
        self.lock().fail_after_moves = Some(moves);
    }

    /// Make `axis` fail to read back; `None` restores it.
    pub fn set_unreadable(&self, axis: Option<Axis>) {
        self.lock().unreadable = axis;
    }

    pub fn raw(&self, axis: Axis) -> i64 {
        self.lock().positions[axis.index()]
    }

    pub fn set_raw(&self, axis: Axis, raw: i64) {
        self.lock().positions[axis.index()] = raw;
    }

    /// Commands accepted so far.
    pub fn moves(&self) -> usize {
        self.lock().moves
    }

    /// Current `(y_eff, z_eff)` in meters.
    pub fn eucentric_offset(&self) -> (f64, f64) {
        let s = self.lock();
        (
            LinearPosition(s.positions[Axis::Y.index()]).meters() - s.axis_y,
            LinearPosition(s.positions[Axis::Z.index()]).meters() - s.axis_z,
        )
    }

    /// Image-plane displacement of the imaged point at the current tilt.
    pub fn tilt_displacement(&self) -> f64 {
        let theta = AngularPosition(self.raw(Axis::Tilt)).radians();
        let (y, z) = self.eucentric_offset();
        y * (1.0 - theta.cos()) + z * theta.sin()
    }

    pub fn driver(&self) -> SimulatedPositioner {
        SimulatedPositioner { stage: self.clone() }
    }

    /// Bounded positioner over this stage with a manual clock.
    pub fn positioner(&self, limits: AxisLimits) -> BoundedPositioner<SimulatedPositioner, ManualClock> {
        BoundedPositioner::with_clock(self.driver(), limits, ManualClock::new())
            .poll_interval(Duration::from_millis(10))
    }
}

/// [`PositionerDriver`] backed by a [`SimulatedStage`].
#[derive(Clone, Debug)]
pub struct SimulatedPositioner {
    stage: SimulatedStage,
}

impl PositionerDriver for SimulatedPositioner {
    fn command(&mut self, axis: Axis, raw: i64) -> Result<(), DriverError> {
        let mut s = self.stage.lock();
        if s.fail_after_moves.is_some_and(|n| s.moves >= n) {
            return Err(DriverError(format!("{axis} drive not responding")));
        }
        s.moves += 1;
        s.positions[axis.index()] = raw;
        s.polls_left = s.settle_polls;
        Ok(())
    }

    fn read_raw(&mut self, axis: Axis) -> Result<i64, DriverError> {
        let s = self.stage.lock();
        if s.unreadable == Some(axis) {
            return Err(DriverError(format!("{axis} encoder not responding")));
        }
        Ok(s.positions[axis.index()])
    }

    fn is_moving(&mut self, _axis: Axis) -> Result<bool, DriverError> {
        let mut s = self.stage.lock();
        if s.polls_left > 0 {
            s.polls_left -= 1;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Smooth random texture on a wrapping lattice.
#[derive(Clone, Debug)]
pub struct SimulatedScene {
    lattice: Vec<f64>,
    cell: f64,
}

impl SimulatedScene {
    const LATTICE: usize = 64;

    /// `cell` is the lattice spacing in pixels.
    pub fn new(seed: u64, cell: f64) -> Self {
        let n = Self::LATTICE;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let lattice = (0..n * n).map(|_| rng.gen_range(0.05..0.95)).collect();
        Self {
            lattice,
            cell: cell.max(1.0),
        }
    }

    fn at(&self, i: i64, j: i64) -> f64 {
        let n = Self::LATTICE as i64;
        self.lattice[(j.rem_euclid(n) * n + i.rem_euclid(n)) as usize]
    }

    /// Intensity in `[0, 1]` at pixel coordinates `(x, y)`.
    pub fn value(&self, x: f64, y: f64) -> f64 {
        let u = x / self.cell;
        let v = y / self.cell;
        let i = u.floor() as i64;
        let j = v.floor() as i64;
        let (fu, fv) = (u - i as f64, v - j as f64);
        let top = self.at(i, j) + fu * (self.at(i + 1, j) - self.at(i, j));
        let bottom = self.at(i, j + 1) + fu * (self.at(i + 1, j + 1) - self.at(i, j + 1));
        top + fv * (bottom - top)
    }
}

/// [`ImagingGateway`] rendering a [`SimulatedScene`] seen through the stage.
#[derive(Debug)]
pub struct SimulatedMicroscope {
    stage: SimulatedStage,
    scene: SimulatedScene,
    beam_shift: BeamShift,
    working_distance: f64,
    captures: usize,
    fail_after_captures: Option<usize>,
}

impl SimulatedMicroscope {
    pub fn new(stage: SimulatedStage, seed: u64) -> Self {
        Self {
            stage,
            scene: SimulatedScene::new(seed, 4.0),
            beam_shift: BeamShift::zeros(),
            working_distance: 4e-3,
            captures: 0,
            fail_after_captures: None,
        }
    }

    pub fn with_scene(mut self, scene: SimulatedScene) -> Self {
        self.scene = scene;
        self
    }

    /// Fail every capture after the first `captures` ones.
    pub fn fail_after_captures(mut self, captures: usize) -> Self {
        self.fail_after_captures = Some(captures);
        self
    }

    pub fn captures(&self) -> usize {
        self.captures
    }

    pub fn stage(&self) -> &SimulatedStage {
        &self.stage
    }

    /// Image content offset in meters: where the scene origin appears.
    pub fn content_offset(&self) -> BeamShift {
        BeamShift::new(-self.beam_shift.x, -self.stage.tilt_displacement() - self.beam_shift.y)
    }
}

impl ImagingGateway for SimulatedMicroscope {
    fn capture_frame(&mut self, settings: &CaptureSettings) -> Result<Frame, ImagingError> {
        if self.fail_after_captures.is_some_and(|n| self.captures >= n) {
            return Err(ImagingError::Hardware("detector readout timed out".into()));
        }
        let (width, height) = (settings.resolution.width, settings.resolution.height);
        let scale = settings.pixel_size();
        let offset = self.content_offset() / scale;
        let max = settings.bit_depth.max_value() as f64;
        let frame = Frame::from_fn(width, height, settings.bit_depth, settings.hfw, |x, y| {
            (self.scene.value(x as f64 - offset.x, y as f64 - offset.y) * max).round() as u16
        })?;
        self.captures += 1;
        debug!(
            "simulated capture {} with content offset {:+.2}, {:+.2} px",
            self.captures, offset.x, offset.y
        );
        Ok(frame)
    }

    fn beam_shift(&mut self) -> Result<BeamShift, ImagingError> {
        Ok(self.beam_shift)
    }

    fn set_beam_shift(&mut self, shift: BeamShift) -> Result<(), ImagingError> {
        if !(shift.x.is_finite() && shift.y.is_finite()) {
            return Err(ImagingError::Hardware(format!("beam shift {shift:?} is not finite")));
        }
        self.beam_shift = shift;
        Ok(())
    }

    fn working_distance(&mut self) -> Result<f64, ImagingError> {
        Ok(self.working_distance)
    }

    fn set_working_distance(&mut self, meters: f64) -> Result<(), ImagingError> {
        if !(meters.is_finite() && meters > 0.0) {
            return Err(ImagingError::Hardware(format!("working distance {meters} out of range")));
        }
        self.working_distance = meters;
        Ok(())
    }
}

/// Keeps every saved frame in memory.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    frames: Arc<Mutex<Vec<(FrameMeta, Frame)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metas(&self) -> Vec<FrameMeta> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(m, _)| *m)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for CollectingSink {
    fn save_frame(&mut self, frame: &Frame, meta: &FrameMeta) -> Result<(), ImagingError> {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((*meta, frame.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Resolution;
    use crate::positioner::{AxisPositions, PositionerGateway};
    use approx::assert_abs_diff_eq;
    use tomotilt_core::BitDepth;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            resolution: Resolution::new(32, 24),
            dwell_time: 1e-6,
            bit_depth: BitDepth::Eight,
            hfw: 32e-7,
        }
    }

    #[test]
    fn scene_wraps_and_stays_in_range() {
        let scene = SimulatedScene::new(5, 4.0);
        let period = 64.0 * 4.0;
        for &(x, y) in &[(0.0, 0.0), (13.3, 7.9), (-2.5, 100.0)] {
            let v = scene.value(x, y);
            assert!((0.0..=1.0).contains(&v));
            assert_abs_diff_eq!(v, scene.value(x + period, y - period), epsilon = 1e-9);
        }
    }

    #[test]
    fn tilting_moves_content_by_the_eucentric_offset() {
        let stage = SimulatedStage::new().with_eucentric_offset(5e-6, 3e-6);
        let mut positioner = stage.positioner(AxisLimits::default());
        positioner
            .move_absolute(&AxisPositions::new().with_tilt(AngularPosition::from_degrees(10.0)))
            .unwrap();
        let theta = 10f64.to_radians();
        assert_abs_diff_eq!(
            stage.tilt_displacement(),
            5e-6 * (1.0 - theta.cos()) + 3e-6 * theta.sin(),
            epsilon = 1e-15
        );
    }

    #[test]
    fn beam_shift_cancels_displacement() {
        let stage = SimulatedStage::new().with_eucentric_offset(0.0, 3e-6);
        stage.set_raw(Axis::Tilt, AngularPosition::from_degrees(20.0).raw());
        let mut scope = SimulatedMicroscope::new(stage.clone(), 1);
        let shifted = scope.capture_frame(&settings()).unwrap();
        scope.set_beam_shift(BeamShift::new(0.0, -stage.tilt_displacement())).unwrap();
        let restored = scope.capture_frame(&settings()).unwrap();
        stage.set_raw(Axis::Tilt, 0);
        scope.set_beam_shift(BeamShift::zeros()).unwrap();
        let untilted = scope.capture_frame(&settings()).unwrap();
        assert_eq!(restored, untilted);
        assert_ne!(shifted, untilted);
        assert_eq!(scope.captures(), 3);
    }

    #[test]
    fn injected_faults() {
        let stage = SimulatedStage::new();
        stage.fail_after_moves(1);
        let mut driver = stage.driver();
        assert!(driver.command(Axis::Tilt, 1).is_ok());
        assert!(driver.command(Axis::Tilt, 2).is_err());
        stage.set_unreadable(Some(Axis::Z));
        assert!(driver.read_raw(Axis::Z).is_err());

        let mut scope = SimulatedMicroscope::new(stage, 1).fail_after_captures(0);
        assert!(matches!(scope.capture_frame(&settings()), Err(ImagingError::Hardware(_))));
    }
}
