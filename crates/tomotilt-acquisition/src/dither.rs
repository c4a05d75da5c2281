//! Beam-shift dithering running beside the step loop.
//!
//! Two flavours share the [`BeamShiftActuator`] with the controller:
//!
//! - [`FreeDither`] is a thread that alternately nudges the beam shift by
//!   `+amplitude` and `−amplitude` on a fixed interval. Stopping it joins the
//!   thread and removes whatever net offset it left behind.
//! - [`InterleavedProbe`] runs one `+amplitude`/`−amplitude` excursion per
//!   turn of a [`TurnHandshake`], strictly between controller steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::handshake::{Turn, TurnHandshake};
use crate::imaging::{BeamShift, BeamShiftActuator, ImagingError, ImagingGateway};

/// How (and whether) the beam shift is dithered during a series.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum DitherMode {
    #[default]
    Off,
    Free { interval: Duration, amplitude: BeamShift },
    Interleaved { amplitude: BeamShift },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherKind {
    Free,
    Interleaved,
}

/// Serialized form of [`DitherMode`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DitherConfig {
    pub mode: DitherKind,
    /// Period of the free-running task, milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Excursion in meters, `[x, y]`.
    pub amplitude: [f64; 2],
}

fn default_interval_ms() -> u64 {
    100
}

impl From<DitherConfig> for DitherMode {
    fn from(c: DitherConfig) -> Self {
        let amplitude = Vector2::new(c.amplitude[0], c.amplitude[1]);
        match c.mode {
            DitherKind::Free => DitherMode::Free {
                interval: Duration::from_millis(c.interval_ms),
                amplitude,
            },
            DitherKind::Interleaved => DitherMode::Interleaved { amplitude },
        }
    }
}

/// Summary of a finished dithering task.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DitherStats {
    pub nudges: usize,
    /// Offset removed on stop to restore the starting beam shift.
    pub restored: BeamShift,
}

/// Handle to a free-running dither thread.
pub struct FreeDither {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<Result<DitherStats, ImagingError>>>,
}

impl FreeDither {
    pub fn spawn<G>(actuator: BeamShiftActuator<G>, interval: Duration, amplitude: BeamShift) -> Self
    where
        G: ImagingGateway + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let join_handle = std::thread::spawn(move || run_free(actuator, interval, amplitude, flag));
        info!("free dither started: interval {interval:?}, amplitude {:.3e}", amplitude.norm());
        Self {
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Signal shutdown, wait for the thread and return what it did.
    pub fn stop(mut self) -> Result<DitherStats, ImagingError> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.join_handle.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(ImagingError::Hardware("dither thread panicked".into())),
            None => Ok(DitherStats::default()),
        }
    }
}

impl Drop for FreeDither {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_free<G: ImagingGateway>(
    actuator: BeamShiftActuator<G>,
    interval: Duration,
    amplitude: BeamShift,
    shutdown: Arc<AtomicBool>,
) -> Result<DitherStats, ImagingError> {
    let mut net = BeamShift::zeros();
    let mut nudges = 0;
    let mut sign = 1.0;
    let result = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        std::thread::sleep(interval);
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        let delta = amplitude * sign;
        if let Err(err) = actuator.nudge(delta) {
            error!("dither nudge failed: {err}");
            break Err(err);
        }
        net += delta;
        nudges += 1;
        sign = -sign;
    };

    let restored = -net;
    if net != BeamShift::zeros() {
        actuator.nudge(restored)?;
    }
    debug!("free dither stopped after {nudges} nudges");
    result.map(|()| DitherStats { nudges, restored })
}

/// Probe task that dithers once per handshake turn.
pub struct InterleavedProbe {
    handshake: Arc<TurnHandshake>,
    join_handle: Option<JoinHandle<Result<DitherStats, ImagingError>>>,
}

impl InterleavedProbe {
    /// Start the probe; the controller holds the first turn.
    pub fn spawn<G>(actuator: BeamShiftActuator<G>, amplitude: BeamShift) -> Self
    where
        G: ImagingGateway + Send + 'static,
    {
        let handshake = Arc::new(TurnHandshake::new(Turn::Controller));
        let hs = Arc::clone(&handshake);
        let join_handle = std::thread::spawn(move || -> Result<DitherStats, ImagingError> {
            let mut nudges = 0;
            while hs.wait_for(Turn::Probe) {
                let excursion = actuator
                    .nudge(amplitude)
                    .and_then(|_| actuator.nudge(-amplitude));
                hs.pass(Turn::Controller);
                if let Err(err) = excursion {
                    error!("probe excursion failed: {err}");
                    // The controller sees the closed handshake on its next wait.
                    hs.close();
                    return Err(err);
                }
                nudges += 2;
            }
            Ok(DitherStats {
                nudges,
                restored: BeamShift::zeros(),
            })
        });
        Self {
            handshake,
            join_handle: Some(join_handle),
        }
    }

    pub fn handshake(&self) -> &Arc<TurnHandshake> {
        &self.handshake
    }

    /// Close the handshake, join the probe, return the turn history.
    pub fn stop(mut self) -> (Vec<Turn>, Result<DitherStats, ImagingError>) {
        self.handshake.close();
        let stats = match self.join_handle.take().map(JoinHandle::join) {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(ImagingError::Hardware("probe thread panicked".into())),
            None => Ok(DitherStats::default()),
        };
        (self.handshake.history(), stats)
    }
}

impl Drop for InterleavedProbe {
    fn drop(&mut self) {
        self.handshake.close();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tomotilt_core::Frame;

    use crate::imaging::CaptureSettings;

    #[derive(Default)]
    struct ShiftOnly {
        shift: BeamShift,
    }

    impl ImagingGateway for ShiftOnly {
        fn capture_frame(&mut self, _: &CaptureSettings) -> Result<Frame, ImagingError> {
            Err(ImagingError::Hardware("no detector".into()))
        }
        fn beam_shift(&mut self) -> Result<BeamShift, ImagingError> {
            Ok(self.shift)
        }
        fn set_beam_shift(&mut self, shift: BeamShift) -> Result<(), ImagingError> {
            self.shift = shift;
            Ok(())
        }
        fn working_distance(&mut self) -> Result<f64, ImagingError> {
            Ok(0.0)
        }
        fn set_working_distance(&mut self, _: f64) -> Result<(), ImagingError> {
            Ok(())
        }
    }

    #[test]
    fn free_dither_restores_starting_shift() {
        let actuator = BeamShiftActuator::new(ShiftOnly {
            shift: BeamShift::new(3e-7, -1e-7),
        });
        let dither = FreeDither::spawn(actuator.clone(), Duration::from_millis(2), BeamShift::new(5e-8, 5e-8));
        std::thread::sleep(Duration::from_millis(25));
        // The controller keeps writing while the dither runs.
        actuator.nudge(BeamShift::new(1e-8, 0.0)).unwrap();
        let stats = dither.stop().unwrap();
        assert!(stats.nudges > 0);
        let end = actuator.get().unwrap();
        assert!((end - BeamShift::new(3.1e-7, -1e-7)).norm() < 1e-18, "{end:?}");
    }

    #[test]
    fn config_converts_to_mode() {
        let cfg: DitherConfig = serde_json::from_str(r#"{ "mode": "free", "amplitude": [1e-8, 0.0] }"#).unwrap();
        assert_eq!(
            DitherMode::from(cfg),
            DitherMode::Free {
                interval: Duration::from_millis(100),
                amplitude: Vector2::new(1e-8, 0.0)
            }
        );
    }
}
