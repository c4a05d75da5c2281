//! Bounded, blocking access to the rotation/translation stage.
//!
//! [`PositionerDriver`] is the raw vendor surface: per-axis commands in
//! hardware units, readback and a "moving" flag. [`BoundedPositioner`]
//! layers the invariants the controller relies on: every target is checked
//! against [`AxisLimits`] before anything is commanded, and each move blocks
//! until all commanded axes report settled or the settle deadline passes.

use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, LinearPosition};

use crate::clock::{Clock, SystemClock};

/// Stage axes the controller knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Tilt,
    Z,
    Y,
    DetectorX,
    DetectorY,
}

impl Axis {
    pub const ALL: [Axis; 5] = [Axis::Tilt, Axis::Z, Axis::Y, Axis::DetectorX, Axis::DetectorY];

    pub(crate) fn index(self) -> usize {
        match self {
            Axis::Tilt => 0,
            Axis::Z => 1,
            Axis::Y => 2,
            Axis::DetectorX => 3,
            Axis::DetectorY => 4,
        }
    }

    /// Format a raw value in this axis' unit.
    fn describe(self, raw: i64) -> String {
        match self {
            Axis::Tilt => AngularPosition(raw).to_string(),
            _ => LinearPosition(raw).to_string(),
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::Tilt => "tilt",
            Axis::Z => "z",
            Axis::Y => "y",
            Axis::DetectorX => "detector-x",
            Axis::DetectorY => "detector-y",
        };
        f.write_str(name)
    }
}

/// Sparse set of per-axis values in hardware units.
///
/// Used both for absolute targets and for relative deltas; axes left unset
/// are not touched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisPositions {
    raw: [Option<i64>; 5],
}

impl AxisPositions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tilt(mut self, angle: AngularPosition) -> Self {
        self.raw[Axis::Tilt.index()] = Some(angle.raw());
        self
    }

    pub fn with_linear(mut self, axis: Axis, value: LinearPosition) -> Self {
        debug_assert!(axis != Axis::Tilt, "tilt is angular");
        self.raw[axis.index()] = Some(value.raw());
        self
    }

    pub fn with_raw(mut self, axis: Axis, raw: i64) -> Self {
        self.raw[axis.index()] = Some(raw);
        self
    }

    pub fn get(&self, axis: Axis) -> Option<i64> {
        self.raw[axis.index()]
    }

    pub fn tilt(&self) -> Option<AngularPosition> {
        self.get(Axis::Tilt).map(AngularPosition)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.iter().all(Option::is_none)
    }

    /// Set axes in [`Axis::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, i64)> + '_ {
        Axis::ALL.into_iter().filter_map(|a| self.get(a).map(|v| (a, v)))
    }
}

/// Result of a position read on one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readout<T> {
    Known(T),
    Unknown,
}

impl<T> Readout<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Readout::Known(v) => Some(v),
            Readout::Unknown => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Readout<U> {
        match self {
            Readout::Known(v) => Readout::Known(f(v)),
            Readout::Unknown => Readout::Unknown,
        }
    }
}

/// Position of every axis as last read from hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionReadout {
    raw: [Readout<i64>; 5],
}

impl PositionReadout {
    pub fn get(&self, axis: Axis) -> Readout<i64> {
        self.raw[axis.index()]
    }

    pub fn tilt(&self) -> Readout<AngularPosition> {
        self.get(Axis::Tilt).map(AngularPosition)
    }

    pub fn linear(&self, axis: Axis) -> Readout<LinearPosition> {
        self.get(axis).map(LinearPosition)
    }
}

/// Closed interval `[min, max]` in hardware units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub min: i64,
    pub max: i64,
}

impl Limit {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, raw: i64) -> bool {
        (self.min..=self.max).contains(&raw)
    }
}

/// Travel range of every axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisLimits {
    pub tilt: Limit,
    pub z: Limit,
    pub y: Limit,
    pub detector_x: Limit,
    pub detector_y: Limit,
}

impl Default for AxisLimits {
    fn default() -> Self {
        let mm = |v: f64| LinearPosition::from_meters(v * 1e-3).raw();
        Self {
            tilt: Limit::new(AngularPosition::from_degrees(-70.0).raw(), AngularPosition::from_degrees(70.0).raw()),
            z: Limit::new(mm(-10.0), mm(10.0)),
            y: Limit::new(mm(-50.0), mm(50.0)),
            detector_x: Limit::new(mm(-5.0), mm(5.0)),
            detector_y: Limit::new(mm(-5.0), mm(5.0)),
        }
    }
}

impl AxisLimits {
    pub fn get(&self, axis: Axis) -> Limit {
        match axis {
            Axis::Tilt => self.tilt,
            Axis::Z => self.z,
            Axis::Y => self.y,
            Axis::DetectorX => self.detector_x,
            Axis::DetectorY => self.detector_y,
        }
    }

    /// Reject the first value outside its axis range.
    pub fn check(&self, targets: &AxisPositions) -> Result<(), PositionerError> {
        for (axis, raw) in targets.iter() {
            let limit = self.get(axis);
            if !limit.contains(raw) {
                return Err(PositionerError::OutOfRange {
                    axis,
                    requested: axis.describe(raw),
                    min: axis.describe(limit.min),
                    max: axis.describe(limit.max),
                });
            }
        }
        Ok(())
    }
}

/// Failure reported by raw stage hardware.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct DriverError(pub String);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PositionerError {
    #[error("{axis} target {requested} outside [{min}, {max}]")]
    OutOfRange {
        axis: Axis,
        requested: String,
        min: String,
        max: String,
    },
    #[error("{axis} position is unknown; relative move refused")]
    UnknownPosition { axis: Axis },
    #[error("{axis} did not settle within {waited:?}")]
    SettleTimeout { axis: Axis, waited: Duration },
    #[error("stage hardware fault: {0}")]
    Hardware(#[from] DriverError),
}

impl PositionerError {
    /// Whether the request was refused before any hardware call.
    pub fn is_rejected_before_motion(&self) -> bool {
        matches!(self, PositionerError::OutOfRange { .. } | PositionerError::UnknownPosition { .. })
    }
}

/// Raw per-axis stage interface.
pub trait PositionerDriver {
    /// Start moving `axis` towards `raw`; returns without waiting.
    fn command(&mut self, axis: Axis, raw: i64) -> Result<(), DriverError>;
    fn read_raw(&mut self, axis: Axis) -> Result<i64, DriverError>;
    fn is_moving(&mut self, axis: Axis) -> Result<bool, DriverError>;
}

/// Blocking stage access used by the controller and calibration sweep.
pub trait PositionerGateway {
    fn limits(&self) -> &AxisLimits;
    /// Move the given axes to absolute targets and wait until settled.
    fn move_absolute(&mut self, targets: &AxisPositions) -> Result<(), PositionerError>;
    /// Move the given axes by the given deltas and wait until settled.
    fn move_relative(&mut self, deltas: &AxisPositions) -> Result<(), PositionerError>;
    /// Current position; axes that fail to read are [`Readout::Unknown`].
    fn read_position(&mut self) -> PositionReadout;
}

pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`PositionerGateway`] over a [`PositionerDriver`] with range checks and a
/// settle deadline.
#[derive(Debug)]
pub struct BoundedPositioner<D, C = SystemClock> {
    driver: D,
    clock: C,
    limits: AxisLimits,
    settle_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<D: PositionerDriver> BoundedPositioner<D, SystemClock> {
    pub fn new(driver: D, limits: AxisLimits) -> Self {
        Self::with_clock(driver, limits, SystemClock::default())
    }
}

impl<D: PositionerDriver, C: Clock> BoundedPositioner<D, C> {
    pub fn with_clock(driver: D, limits: AxisLimits, clock: C) -> Self {
        Self {
            driver,
            clock,
            limits,
            settle_timeout: Some(DEFAULT_SETTLE_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// `None` waits indefinitely.
    pub fn settle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    fn wait_settled(&mut self, targets: &AxisPositions) -> Result<(), PositionerError> {
        let start = self.clock.now();
        loop {
            let mut still_moving = None;
            for (axis, _) in targets.iter() {
                if self.driver.is_moving(axis)? {
                    still_moving = Some(axis);
                    break;
                }
            }
            let Some(axis) = still_moving else {
                return Ok(());
            };

            let waited = self.clock.now().saturating_sub(start);
            if let Some(limit) = self.settle_timeout {
                if waited >= limit {
                    warn!("{axis} still moving after {waited:?}");
                    return Err(PositionerError::SettleTimeout { axis, waited });
                }
            }
            self.clock.sleep(self.poll_interval);
        }
    }
}

impl<D: PositionerDriver, C: Clock> PositionerGateway for BoundedPositioner<D, C> {
    fn limits(&self) -> &AxisLimits {
        &self.limits
    }

    fn move_absolute(&mut self, targets: &AxisPositions) -> Result<(), PositionerError> {
        self.limits.check(targets)?;
        for (axis, raw) in targets.iter() {
            debug!("command {axis} -> {}", axis.describe(raw));
            self.driver.command(axis, raw)?;
        }
        self.wait_settled(targets)
    }

    fn move_relative(&mut self, deltas: &AxisPositions) -> Result<(), PositionerError> {
        let mut targets = AxisPositions::new();
        for (axis, delta) in deltas.iter() {
            let current = self
                .driver
                .read_raw(axis)
                .map_err(|_| PositionerError::UnknownPosition { axis })?;
            targets = targets.with_raw(axis, current.saturating_add(delta));
        }
        self.move_absolute(&targets)
    }

    fn read_position(&mut self) -> PositionReadout {
        let mut raw = [Readout::Unknown; 5];
        for axis in Axis::ALL {
            raw[axis.index()] = match self.driver.read_raw(axis) {
                Ok(v) => Readout::Known(v),
                Err(err) => {
                    debug!("{axis} readback failed: {err}");
                    Readout::Unknown
                }
            };
        }
        PositionReadout { raw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    /// Settles after a fixed number of polls; records every command.
    #[derive(Default)]
    struct ScriptedDriver {
        positions: [i64; 5],
        polls_to_settle: usize,
        polls_left: usize,
        commands: Vec<(Axis, i64)>,
        unreadable: Option<Axis>,
    }

    impl PositionerDriver for ScriptedDriver {
        fn command(&mut self, axis: Axis, raw: i64) -> Result<(), DriverError> {
            self.commands.push((axis, raw));
            self.positions[axis.index()] = raw;
            self.polls_left = self.polls_to_settle;
            Ok(())
        }

        fn read_raw(&mut self, axis: Axis) -> Result<i64, DriverError> {
            if self.unreadable == Some(axis) {
                return Err(DriverError("no reply".into()));
            }
            Ok(self.positions[axis.index()])
        }

        fn is_moving(&mut self, _axis: Axis) -> Result<bool, DriverError> {
            if self.polls_left == usize::MAX {
                return Ok(true);
            }
            if self.polls_left > 0 {
                self.polls_left -= 1;
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn positioner(driver: ScriptedDriver) -> BoundedPositioner<ScriptedDriver, ManualClock> {
        BoundedPositioner::with_clock(driver, AxisLimits::default(), ManualClock::new())
    }

    #[test]
    fn out_of_range_commands_nothing() {
        let mut p = positioner(ScriptedDriver::default());
        let targets = AxisPositions::new()
            .with_linear(Axis::Z, LinearPosition::from_meters(1e-3))
            .with_tilt(AngularPosition::from_degrees(75.0));
        let err = p.move_absolute(&targets).unwrap_err();
        assert!(matches!(err, PositionerError::OutOfRange { axis: Axis::Tilt, .. }));
        assert!(err.is_rejected_before_motion());
        assert!(p.driver().commands.is_empty());
    }

    #[test]
    fn boundary_values_are_inside() {
        let mut p = positioner(ScriptedDriver::default());
        let edge = AngularPosition::from_degrees(70.0);
        p.move_absolute(&AxisPositions::new().with_tilt(edge)).unwrap();
        assert_eq!(p.read_position().tilt(), Readout::Known(edge));
    }

    #[test]
    fn relative_move_is_range_checked_against_current_position() {
        let mut p = positioner(ScriptedDriver::default());
        p.move_absolute(&AxisPositions::new().with_tilt(AngularPosition::from_degrees(65.0)))
            .unwrap();
        let step = AxisPositions::new().with_tilt(AngularPosition::from_degrees(10.0));
        assert!(matches!(p.move_relative(&step), Err(PositionerError::OutOfRange { .. })));
        assert_eq!(p.driver().commands.len(), 1);
    }

    #[test]
    fn relative_move_on_unknown_axis_is_refused() {
        let mut p = positioner(ScriptedDriver {
            unreadable: Some(Axis::Y),
            ..ScriptedDriver::default()
        });
        let delta = AxisPositions::new().with_linear(Axis::Y, LinearPosition::from_meters(1e-6));
        assert_eq!(
            p.move_relative(&delta),
            Err(PositionerError::UnknownPosition { axis: Axis::Y })
        );
        assert!(p.driver().commands.is_empty());
        assert_eq!(p.read_position().get(Axis::Y), Readout::Unknown);
        assert_eq!(p.read_position().get(Axis::Z), Readout::Known(0));
    }

    #[test]
    fn waits_for_settle_using_poll_interval() {
        let clock = ManualClock::new();
        let mut p = BoundedPositioner::with_clock(
            ScriptedDriver {
                polls_to_settle: 4,
                ..ScriptedDriver::default()
            },
            AxisLimits::default(),
            clock.clone(),
        )
        .poll_interval(Duration::from_millis(10));
        p.move_absolute(&AxisPositions::new().with_tilt(AngularPosition::from_degrees(2.0)))
            .unwrap();
        assert_eq!(clock.now(), Duration::from_millis(40));
    }

    #[test]
    fn settle_timeout_is_deterministic_with_manual_clock() {
        let clock = ManualClock::new();
        let mut p = BoundedPositioner::with_clock(
            ScriptedDriver {
                polls_to_settle: usize::MAX,
                ..ScriptedDriver::default()
            },
            AxisLimits::default(),
            clock.clone(),
        )
        .settle_timeout(Some(Duration::from_millis(200)))
        .poll_interval(Duration::from_millis(50));

        let err = p
            .move_absolute(&AxisPositions::new().with_tilt(AngularPosition::from_degrees(1.0)))
            .unwrap_err();
        assert_eq!(
            err,
            PositionerError::SettleTimeout {
                axis: Axis::Tilt,
                waited: Duration::from_millis(200)
            }
        );
        assert_eq!(clock.now(), Duration::from_millis(200));
    }
}
