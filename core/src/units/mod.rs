//! Unit conversions applied at the solver boundary.
//!
//! Inside the solver every length is in document units (millimetres) and every
//! angle is in radians. Constraint builders take a tagged value and convert once.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LengthUnit {
    #[default]
    Millimeter,
    Centimeter,
    Meter,
    Inch,
    Foot,
}

impl LengthUnit {
    pub fn to_mm(&self, value: f64) -> f64 {
        match self {
            Self::Millimeter => value,
            Self::Centimeter => value * 10.0,
            Self::Meter => value * 1000.0,
            Self::Inch => value * 25.4,
            Self::Foot => value * 304.8,
        }
    }

    pub fn from_mm(&self, mm: f64) -> f64 {
        match self {
            Self::Millimeter => mm,
            Self::Centimeter => mm / 10.0,
            Self::Meter => mm / 1000.0,
            Self::Inch => mm / 25.4,
            Self::Foot => mm / 304.8,
        }
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millimeter => write!(f, "mm"),
            Self::Centimeter => write!(f, "cm"),
            Self::Meter => write!(f, "m"),
            Self::Inch => write!(f, "in"),
            Self::Foot => write!(f, "ft"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AngleUnit {
    #[default]
    Degrees,
    Radians,
}

impl AngleUnit {
    /// Convert value to radians (base unit for angles)
    pub fn to_radians(&self, value: f64) -> f64 {
        match self {
            Self::Degrees => value.to_radians(),
            Self::Radians => value,
        }
    }

    /// Convert from radians to this unit
    pub fn from_radians(&self, radians: f64) -> f64 {
        match self {
            Self::Degrees => radians.to_degrees(),
            Self::Radians => radians,
        }
    }
}

impl fmt::Display for AngleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degrees => write!(f, "deg"),
            Self::Radians => write!(f, "rad"),
        }
    }
}

/// Unit tag carried by a constraint constant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Unit {
    #[default]
    Dimensionless,
    Length(LengthUnit),
    Angle(AngleUnit),
}

impl Unit {
    /// Convert a value to base units (mm for length, radians for angle)
    pub fn to_base(&self, value: f64) -> f64 {
        match self {
            Self::Dimensionless => value,
            Self::Length(lu) => lu.to_mm(value),
            Self::Angle(au) => au.to_radians(value),
        }
    }

    /// Convert a base-unit value back to this unit for display.
    pub fn from_base(&self, value: f64) -> f64 {
        match self {
            Self::Dimensionless => value,
            Self::Length(lu) => lu.from_mm(value),
            Self::Angle(au) => au.from_radians(value),
        }
    }
}
