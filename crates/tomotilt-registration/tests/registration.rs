use approx::assert_abs_diff_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tomotilt_core::{BitDepth, Frame};
use tomotilt_registration::{PatchCorrelationRegistrar, RegistrationParams, DEFAULT_MAX_SHIFT};

const WIDTH: usize = 64;
const HEIGHT: usize = 64;
/// 100 nm per pixel.
const HFW: f64 = WIDTH as f64 * 1e-7;

/// Value-noise texture on a wrapping lattice, evaluated at continuous coordinates.
struct Scene {
    lattice: Vec<f64>,
    n: usize,
    cell: f64,
}

impl Scene {
    fn new(seed: u64) -> Self {
        let n = 32;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let lattice = (0..n * n).map(|_| rng.gen_range(200.0..4000.0)).collect();
        Self { lattice, n, cell: 4.0 }
    }

    fn at(&self, i: i64, j: i64) -> f64 {
        let n = self.n as i64;
        self.lattice[(j.rem_euclid(n) * n + i.rem_euclid(n)) as usize]
    }

    fn value(&self, x: f64, y: f64) -> f64 {
        let u = x / self.cell;
        let v = y / self.cell;
        let i = u.floor() as i64;
        let j = v.floor() as i64;
        let fu = u - i as f64;
        let fv = v - j as f64;
        let a = self.at(i, j) + fu * (self.at(i + 1, j) - self.at(i, j));
        let b = self.at(i, j + 1) + fu * (self.at(i + 1, j + 1) - self.at(i, j + 1));
        a + fv * (b - a)
    }

    /// Frame whose content is moved by `(sx, sy)` pixels.
    fn frame(&self, sx: f64, sy: f64) -> Frame {
        Frame::from_fn(WIDTH, HEIGHT, BitDepth::Sixteen, HFW, |x, y| {
            self.value(x as f64 - sx, y as f64 - sy).round() as u16
        })
        .expect("valid frame")
    }
}

fn registrar(subpixel: bool) -> PatchCorrelationRegistrar {
    PatchCorrelationRegistrar::new(RegistrationParams {
        grid_size: 4,
        template_ratio: 0.5,
        subpixel,
        ..RegistrationParams::default()
    })
}

#[test]
fn self_registration_is_a_no_op() {
    for seed in [1, 7, 42] {
        let frame = Scene::new(seed).frame(0.0, 0.0);
        for subpixel in [false, true] {
            let res = registrar(subpixel).register(&frame, &frame).expect("register");
            assert_abs_diff_eq!(res.dx_px, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(res.dy_px, 0.0, epsilon = 1e-9);
            assert!(res.confidence > 0.99, "confidence {}", res.confidence);
            assert_eq!(res.patches_total, 16);
        }
    }
}

#[test]
fn recovers_integer_shift_in_physical_units() {
    let scene = Scene::new(3);
    let reference = scene.frame(0.0, 0.0);
    let target = scene.frame(3.0, -2.0);

    let res = PatchCorrelationRegistrar::match_frames(&reference, &target, 4, 0.5).expect("register");
    // Content moved by (+3, -2) so the patch origin sits (-3, +2) from the peak.
    assert_abs_diff_eq!(res.dx_px, -3.0, epsilon = 1e-9);
    assert_abs_diff_eq!(res.dy_px, 2.0, epsilon = 1e-9);
    assert_abs_diff_eq!(res.dx, -3.0e-7, epsilon = 1e-15);
    assert_abs_diff_eq!(res.dy, 2.0e-7, epsilon = 1e-15);
    assert!(!res.is_low_confidence());
}

#[test]
fn registration_is_antisymmetric() {
    let scene = Scene::new(11);
    let a = scene.frame(0.0, 0.0);
    let b = scene.frame(-4.0, 5.0);

    let ab = registrar(false).register(&a, &b).expect("a->b");
    let ba = registrar(false).register(&b, &a).expect("b->a");
    assert_abs_diff_eq!(ab.dx_px, -ba.dx_px, epsilon = 1e-9);
    assert_abs_diff_eq!(ab.dy_px, -ba.dy_px, epsilon = 1e-9);
}

#[test]
fn subpixel_refinement_tracks_fractional_shift() {
    let scene = Scene::new(5);
    let a = scene.frame(0.0, 0.0);
    let b = scene.frame(1.5, -0.25);

    let ab = registrar(true).register(&a, &b).expect("a->b");
    let ba = registrar(true).register(&b, &a).expect("b->a");
    assert_abs_diff_eq!(ab.dx_px, -1.5, epsilon = 0.35);
    assert_abs_diff_eq!(ab.dy_px, 0.25, epsilon = 0.35);
    assert_abs_diff_eq!(ab.dx_px, -ba.dx_px, epsilon = 0.35);
    assert_abs_diff_eq!(ab.dy_px, -ba.dy_px, epsilon = 0.35);
}

#[test]
fn bounded_search_misses_large_shift() {
    let scene = Scene::new(9);
    let a = scene.frame(0.0, 0.0);
    let b = scene.frame(6.0, 0.0);
    let res = PatchCorrelationRegistrar::new(RegistrationParams {
        max_shift: Some(2),
        ..RegistrationParams::default()
    })
    .register(&a, &b)
    .expect("register");
    // The true peak is outside the window; whatever is found is poorer.
    assert!(res.confidence < 0.99, "confidence {}", res.confidence);
}

#[test]
fn params_deserialize_with_defaults() {
    let params: RegistrationParams = serde_json::from_str(r#"{ "grid_size": 6, "max_shift": 32 }"#).unwrap();
    assert_eq!(params.grid_size, 6);
    assert_eq!(params.max_shift, Some(32));
    assert_eq!(params.outlier_passes, 2);
    assert_eq!(params.template_ratio, 0.5);
}

#[test]
fn default_search_window_is_bounded() {
    assert_eq!(RegistrationParams::default().max_shift, Some(DEFAULT_MAX_SHIFT));
    let params: RegistrationParams = serde_json::from_str(r#"{ "grid_size": 2 }"#).unwrap();
    assert_eq!(params.max_shift, Some(DEFAULT_MAX_SHIFT));

    let full: RegistrationParams = serde_json::from_str(r#"{ "max_shift": null }"#).unwrap();
    assert_eq!(full.max_shift, None);
}
