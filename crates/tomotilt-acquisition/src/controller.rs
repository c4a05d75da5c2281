//! Tilt-series step loop.
//!
//! One step is: capture, correct, advance. Capture grabs every configured
//! channel at the current tilt. Correction registers the first channel
//! against the previous step's frame and nudges the beam shift. Advance
//! moves the tilt by one increment and blocks until the stage settles.
//! The order never changes and cancellation is honoured only between steps.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, DisplacementSample, Frame, SweepDirection};
use tomotilt_registration::{PatchCorrelationRegistrar, RegistrationParams};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::config::AcquisitionConfig;
use crate::dither::{DitherMode, DitherStats, FreeDither, InterleavedProbe};
use crate::drift::DriftCorrectionLoop;
use crate::error::AcquisitionError;
use crate::focus::FocusAdaptation;
use crate::handshake::{CancellationToken, Turn};
use crate::imaging::{BeamShift, BeamShiftActuator, CaptureSettings, FrameMeta, FrameSink, ImagingError, ImagingGateway};
use crate::positioner::{Axis, AxisPositions, PositionerError, PositionerGateway, Readout};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    #[default]
    Idle,
    Stepping,
    Correcting,
    Advancing,
    Done,
    Faulted,
}

/// What a series needs beyond the hardware handles.
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesSettings {
    pub capture: CaptureSettings,
    pub channels: usize,
    pub increment: AngularPosition,
    pub end: AngularPosition,
    pub drift_correction: bool,
    pub focus_correction: bool,
    pub anticipation: bool,
    pub correction_gain: f64,
    pub registration: RegistrationParams,
    pub dither: DitherMode,
}

impl From<&AcquisitionConfig> for SeriesSettings {
    fn from(c: &AcquisitionConfig) -> Self {
        Self {
            capture: c.capture_settings(),
            channels: c.channels,
            increment: c.increment(),
            end: c.end(),
            drift_correction: c.drift_correction,
            focus_correction: c.focus_correction,
            anticipation: c.anticipation,
            correction_gain: c.correction_gain,
            registration: c.registration.clone(),
            dither: c.dither_mode(),
        }
    }
}

/// Outcome of a completed (or cancelled) series.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    pub steps_planned: usize,
    pub steps_completed: usize,
    pub captured_angles: Vec<AngularPosition>,
    /// Frame-to-frame drift of every confident registration.
    pub samples: Vec<DisplacementSample>,
    /// Beam-shift increments actually applied.
    pub corrections: Vec<BeamShift>,
    pub skipped_corrections: usize,
    pub cancelled: bool,
    pub final_beam_shift: BeamShift,
    /// Turn order when dithering was interleaved.
    pub turns: Vec<Turn>,
    pub dither_nudges: usize,
}

/// Captures needed to go from `current` to `end` in `increment` steps,
/// endpoints included: `⌈|end − current| / increment⌉ + 1`.
///
/// `None` when `increment` is not positive.
pub fn step_count(current: AngularPosition, end: AngularPosition, increment: AngularPosition) -> Option<usize> {
    let inc = increment.raw();
    if inc <= 0 {
        return None;
    }
    let span = (end - current).raw().unsigned_abs();
    let inc = inc.unsigned_abs();
    Some((span.div_ceil(inc) + 1) as usize)
}

fn clamp_towards(angle: AngularPosition, end: AngularPosition, direction: SweepDirection) -> AngularPosition {
    match direction {
        SweepDirection::Ascending => angle.min(end),
        SweepDirection::Descending => angle.max(end),
    }
}

enum DitherTask {
    Off,
    Free(FreeDither),
    Interleaved(InterleavedProbe),
}

impl DitherTask {
    fn start<G: ImagingGateway + Send + 'static>(mode: DitherMode, actuator: &BeamShiftActuator<G>) -> Self {
        match mode {
            DitherMode::Off => DitherTask::Off,
            DitherMode::Free { interval, amplitude } => {
                DitherTask::Free(FreeDither::spawn(actuator.clone(), interval, amplitude))
            }
            DitherMode::Interleaved { amplitude } => {
                DitherTask::Interleaved(InterleavedProbe::spawn(actuator.clone(), amplitude))
            }
        }
    }

    /// Wait for the controller's turn; `false` if the probe has gone away.
    fn begin_step(&self) -> bool {
        match self {
            DitherTask::Interleaved(probe) => probe.handshake().wait_for(Turn::Controller),
            _ => true,
        }
    }

    fn end_step(&self) {
        if let DitherTask::Interleaved(probe) = self {
            probe.handshake().pass(Turn::Probe);
        }
    }

    fn stop(self) -> (Vec<Turn>, Result<DitherStats, ImagingError>) {
        match self {
            DitherTask::Off => (Vec::new(), Ok(DitherStats::default())),
            DitherTask::Free(task) => (Vec::new(), task.stop()),
            DitherTask::Interleaved(probe) => probe.stop(),
        }
    }
}

fn faulted(report: &AcquisitionReport, source: AcquisitionError) -> AcquisitionError {
    AcquisitionError::Faulted {
        last_good_step: report.steps_completed.checked_sub(1),
        last_angle: report.captured_angles.last().copied(),
        source: Box::new(source),
    }
}

/// Closed-loop tilt-series controller.
pub struct TiltSeriesController<P, G> {
    positioner: P,
    actuator: BeamShiftActuator<G>,
    settings: SeriesSettings,
    registrar: PatchCorrelationRegistrar,
    drift: DriftCorrectionLoop,
    focus: Option<Box<dyn FocusAdaptation>>,
    sink: Option<Box<dyn FrameSink>>,
    cancel: CancellationToken,
    state: ControllerState,
}

impl<P, G> TiltSeriesController<P, G>
where
    P: PositionerGateway,
    G: ImagingGateway + Send + 'static,
{
    pub fn new(positioner: P, imaging: G, settings: SeriesSettings) -> Self {
        Self::with_actuator(positioner, BeamShiftActuator::new(imaging), settings)
    }

    /// Share an existing actuator, e.g. with an external dithering task.
    pub fn with_actuator(positioner: P, actuator: BeamShiftActuator<G>, settings: SeriesSettings) -> Self {
        Self {
            positioner,
            actuator,
            registrar: PatchCorrelationRegistrar::new(settings.registration.clone()),
            drift: DriftCorrectionLoop::new(settings.anticipation, settings.correction_gain),
            settings,
            focus: None,
            sink: None,
            cancel: CancellationToken::new(),
            state: ControllerState::Idle,
        }
    }

    pub fn from_config(positioner: P, imaging: G, config: &AcquisitionConfig) -> Self {
        Self::new(positioner, imaging, SeriesSettings::from(config))
    }

    pub fn with_focus(mut self, focus: Box<dyn FocusAdaptation>) -> Self {
        self.focus = Some(focus);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn settings(&self) -> &SeriesSettings {
        &self.settings
    }

    pub fn actuator(&self) -> &BeamShiftActuator<G> {
        &self.actuator
    }

    pub fn positioner(&self) -> &P {
        &self.positioner
    }

    pub fn positioner_mut(&mut self) -> &mut P {
        &mut self.positioner
    }

    pub fn into_parts(self) -> (P, BeamShiftActuator<G>) {
        (self.positioner, self.actuator)
    }

    fn enter(&mut self, state: ControllerState) {
        if self.state != state {
            debug!("{:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Run the series from the current tilt to the configured end.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self), fields(end = %self.settings.end, increment = %self.settings.increment))
    )]
    pub fn run(&mut self) -> Result<AcquisitionReport, AcquisitionError> {
        self.enter(ControllerState::Idle);
        self.drift.reset();
        let mut report = AcquisitionReport::default();

        let start = match self.positioner.read_position().tilt() {
            Readout::Known(angle) => angle,
            Readout::Unknown => {
                self.enter(ControllerState::Faulted);
                return Err(faulted(&report, PositionerError::UnknownPosition { axis: Axis::Tilt }.into()));
            }
        };
        let Some(total) = step_count(start, self.settings.end, self.settings.increment) else {
            self.enter(ControllerState::Faulted);
            return Err(AcquisitionError::InvalidSettings(format!(
                "tilt increment must be positive, got {}",
                self.settings.increment
            )));
        };
        report.steps_planned = total;
        info!(
            "tilt series {} -> {} in {} captures",
            start, self.settings.end, total
        );

        let dither = DitherTask::start(self.settings.dither, &self.actuator);
        let outcome = self.step_loop(start, total, &dither, &mut report);
        let (turns, dither_stats) = dither.stop();
        report.turns = turns;

        let outcome = outcome.and_then(|()| {
            let stats = dither_stats.map_err(|e| AcquisitionError::Dither(e.to_string()))?;
            report.dither_nudges = stats.nudges;
            report.final_beam_shift = self.actuator.get()?;
            Ok(())
        });

        match outcome {
            Ok(()) => {
                self.enter(ControllerState::Done);
                info!(
                    "series finished: {}/{} captures, {} corrections{}",
                    report.steps_completed,
                    report.steps_planned,
                    report.corrections.len(),
                    if report.cancelled { " (cancelled)" } else { "" }
                );
                Ok(report)
            }
            Err(err) => {
                self.enter(ControllerState::Faulted);
                warn!("series faulted after {} captures: {err}", report.steps_completed);
                Err(faulted(&report, err))
            }
        }
    }

    fn step_loop(
        &mut self,
        start: AngularPosition,
        total: usize,
        dither: &DitherTask,
        report: &mut AcquisitionReport,
    ) -> Result<(), AcquisitionError> {
        let end = self.settings.end;
        let direction = SweepDirection::between(start, end);
        let step = self.settings.increment * direction.sign();
        let mut angle = start;
        let mut previous: Option<Frame> = None;

        for index in 0..total {
            if self.cancel.is_cancelled() {
                info!("cancelled before step {index}");
                report.cancelled = true;
                break;
            }
            if !dither.begin_step() {
                return Err(AcquisitionError::Dither("probe task stopped".into()));
            }

            self.enter(ControllerState::Stepping);
            let capture = self.settings.capture;
            let channels = self.settings.channels;
            let frames = self.actuator.with_gateway(|g| g.capture_channels(&capture, channels))?;
            if let Some(sink) = self.sink.as_mut() {
                for (channel, frame) in frames.iter().enumerate() {
                    sink.save_frame(frame, &FrameMeta { step: index, channel, angle })?;
                }
            }
            let Some(current) = frames.into_iter().next() else {
                return Err(ImagingError::Hardware("capture returned no frames".into()).into());
            };
            report.steps_completed += 1;
            report.captured_angles.push(angle);
            debug!("step {index}: captured at {angle}");

            let next = (index + 1 < total).then(|| clamp_towards(angle + step, end, direction));

            self.enter(ControllerState::Correcting);
            if self.settings.drift_correction {
                if let Some(prev) = previous.as_ref() {
                    self.correct(prev, &current, angle, report)?;
                }
            }
            if self.settings.focus_correction {
                if let (Some(focus), Some(next)) = (self.focus.as_mut(), next) {
                    if let Some(dwd) = focus.working_distance_delta(angle, next) {
                        self.actuator.with_gateway(|g| -> Result<(), ImagingError> {
                            let wd = g.working_distance()?;
                            g.set_working_distance(wd + dwd)
                        })?;
                        debug!("working distance {dwd:+.3e} for {next}");
                    }
                }
            }
            previous = Some(current);

            if let Some(next) = next {
                self.enter(ControllerState::Advancing);
                self.positioner
                    .move_relative(&AxisPositions::new().with_tilt(next - angle))?;
                angle = self.positioner.read_position().tilt().known().unwrap_or(next);
            }
            dither.end_step();
        }
        Ok(())
    }

    fn correct(
        &mut self,
        previous: &Frame,
        current: &Frame,
        angle: AngularPosition,
        report: &mut AcquisitionReport,
    ) -> Result<(), AcquisitionError> {
        let measured = match self.registrar.register(previous, current) {
            Ok(measured) => measured,
            Err(err) => {
                warn!("registration at {angle} rejected ({err}); no correction");
                report.skipped_corrections += 1;
                return Ok(());
            }
        };
        match self.drift.update(&measured) {
            Some(delta) => {
                self.actuator.nudge(delta)?;
                report.samples.push(DisplacementSample::new(angle, measured.dx, measured.dy));
                report.corrections.push(delta);
                debug!(
                    "drift {:+.2},{:+.2} px (conf {:.2}) -> beam shift {:+.3e},{:+.3e}",
                    measured.dx_px, measured.dy_px, measured.confidence, delta.x, delta.y
                );
            }
            None => report.skipped_corrections += 1,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deg(d: f64) -> AngularPosition {
        AngularPosition::from_degrees(d)
    }

    #[test]
    fn step_count_includes_both_ends() {
        assert_eq!(step_count(deg(0.0), deg(10.0), deg(2.0)), Some(6));
        assert_eq!(step_count(deg(-60.0), deg(60.0), deg(3.0)), Some(41));
        assert_eq!(step_count(deg(10.0), deg(-10.0), deg(2.0)), Some(11));
        assert_eq!(step_count(deg(0.0), deg(9.0), deg(2.0)), Some(6));
        assert_eq!(step_count(deg(5.0), deg(5.0), deg(2.0)), Some(1));
        assert_eq!(step_count(deg(0.0), deg(5.0), deg(0.0)), None);
    }

    #[test]
    fn last_move_is_clamped_to_end() {
        assert_eq!(clamp_towards(deg(10.0), deg(9.0), SweepDirection::Ascending), deg(9.0));
        assert_eq!(clamp_towards(deg(-10.0), deg(-9.0), SweepDirection::Descending), deg(-9.0));
        assert_eq!(clamp_towards(deg(4.0), deg(9.0), SweepDirection::Ascending), deg(4.0));
    }
}
