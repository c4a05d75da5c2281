/// Invalid input handed to the registrar.
///
/// These abort a single registration only; callers in a control loop treat
/// them like a zero-confidence result.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistrationError {
    #[error("frame size mismatch: reference {reference:?}, target {target:?}")]
    SizeMismatch {
        reference: (usize, usize),
        target: (usize, usize),
    },
    #[error("grid size must be at least 1")]
    InvalidGridSize,
    #[error("template ratio must lie in (0, 1], got {0}")]
    InvalidTemplateRatio(f64),
    #[error("{grid_size}x{grid_size} grid over a {template_w}x{template_h} template leaves empty patches")]
    PatchTooSmall {
        grid_size: usize,
        template_w: usize,
        template_h: usize,
    },
}
