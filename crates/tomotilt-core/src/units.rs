//! Hardware-native position units.
//!
//! Positioners speak integers: micro-degrees for rotation axes and
//! picometres (nanometres ×1000) for translation axes. Keeping the raw
//! integer avoids rounding drift when the controller accumulates many
//! relative steps.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Rotation-axis position, 1_000_000 units per degree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AngularPosition(pub i64);

impl AngularPosition {
    pub const UNITS_PER_DEGREE: i64 = 1_000_000;
    pub const ZERO: Self = Self(0);

    pub fn from_degrees(deg: f64) -> Self {
        Self((deg * Self::UNITS_PER_DEGREE as f64).round() as i64)
    }

    pub fn degrees(self) -> f64 {
        self.0 as f64 / Self::UNITS_PER_DEGREE as f64
    }

    pub fn radians(self) -> f64 {
        self.degrees().to_radians()
    }

    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn signum(self) -> i64 {
        self.0.signum()
    }
}

impl fmt::Display for AngularPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}°", self.degrees())
    }
}

/// Translation-axis position in picometres (nanometres ×1000).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinearPosition(pub i64);

impl LinearPosition {
    pub const UNITS_PER_NANOMETER: i64 = 1_000;
    pub const ZERO: Self = Self(0);

    pub fn from_meters(m: f64) -> Self {
        Self((m * 1e9 * Self::UNITS_PER_NANOMETER as f64).round() as i64)
    }

    pub fn meters(self) -> f64 {
        self.0 as f64 / Self::UNITS_PER_NANOMETER as f64 * 1e-9
    }

    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LinearPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} nm", self.0 as f64 / Self::UNITS_PER_NANOMETER as f64)
    }
}

macro_rules! impl_position_ops {
    ($t:ty) => {
        impl Add for $t {
            type Output = Self;
            fn add(self, rhs: Self) -> Self {
                Self(self.0 + rhs.0)
            }
        }

        impl Sub for $t {
            type Output = Self;
            fn sub(self, rhs: Self) -> Self {
                Self(self.0 - rhs.0)
            }
        }

        impl Neg for $t {
            type Output = Self;
            fn neg(self) -> Self {
                Self(-self.0)
            }
        }

        impl Mul<i64> for $t {
            type Output = Self;
            fn mul(self, rhs: i64) -> Self {
                Self(self.0 * rhs)
            }
        }
    };
}

impl_position_ops!(AngularPosition);
impl_position_ops!(LinearPosition);
