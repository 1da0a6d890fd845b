use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroSize { width, height });
        }
        Ok(Self { width, height })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPoint {
    pub x: i64,
    pub y: i64,
}

impl LogicalPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledPoint {
    pub x: i64,
    pub y: i64,
}

/// Maps `point` from `from` space into `to` space.
///
/// Each axis is scaled independently as `round(v * to / from)` and clamped to
/// `[0, to - 1]`. Zero-sized inputs are a caller contract violation and are
/// reported as [`ConfigError::ZeroSize`].
pub fn scale(point: LogicalPoint, from: Size, to: Size) -> Result<ScaledPoint, ConfigError> {
    if from.width == 0 || from.height == 0 {
        return Err(ConfigError::ZeroSize { width: from.width, height: from.height });
    }
    if to.width == 0 || to.height == 0 {
        return Err(ConfigError::ZeroSize { width: to.width, height: to.height });
    }
    Ok(ScaledPoint {
        x: scale_axis(point.x, from.width, to.width),
        y: scale_axis(point.y, from.height, to.height),
    })
}

fn scale_axis(v: i64, from: u32, to: u32) -> i64 {
    let scaled = (v as f64 * to as f64 / from as f64).round() as i64;
    scaled.clamp(0, to as i64 - 1)
}

pub fn pointer_debug(logical: LogicalPoint, from: Size, physical: ScaledPoint, to: Size) -> String {
    let (mw, mh) = (from.width.max(1), from.height.max(1));
    let (sw, sh) = (to.width.max(1), to.height.max(1));
    format!(
        "model=({},{}) screen=({},{}) model_ratio=({:.4},{:.4}) screen_ratio=({:.4},{:.4}) screen_max=({},{})",
        logical.x,
        logical.y,
        physical.x,
        physical.y,
        logical.x as f64 / mw as f64,
        logical.y as f64 / mh as f64,
        physical.x as f64 / sw as f64,
        physical.y as f64 / sh as f64,
        sw - 1,
        sh - 1,
    )
}
