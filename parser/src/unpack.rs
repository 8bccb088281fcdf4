//! Dequantization of the packed values carried by minimap and squadron updates.

use modular_bitfield::prelude::*;

/// Minimap coordinates outside this range are not representable.
pub const MINIMAP_EXTENT: f64 = 2500.0;

/// Position reported for ships that dropped off the minimap.
pub const HIDDEN_POSITION: (f64, f64) = (-MINIMAP_EXTENT, -MINIMAP_EXTENT);

/// Maps `packed` in `0..2^bits` linearly onto `min..=max`.
pub fn unpack_value(packed: u64, bits: u32, min: f64, max: f64) -> f64 {
    let steps = ((1u64 << bits) - 1) as f64;
    let span = min.abs() + max.abs();
    packed as f64 / steps * span - min.abs()
}

/// Splits `packed` into consecutive fields of the given widths, least
/// significant bits first.
pub fn unpack_values(packed: u64, widths: &[u32]) -> Vec<u64> {
    let mut rest = packed;
    widths
        .iter()
        .map(|&bits| {
            let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
            let value = rest & mask;
            rest = if bits >= 64 { 0 } else { rest >> bits };
            value
        })
        .collect()
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
struct RawMinimapPosition {
    x: B11,
    y: B11,
    yaw: B8,
    #[skip]
    __: B2,
}

/// A decoded `packedData` from `updateMinimapVisionInfo`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimapPosition {
    pub x: f64,
    pub y: f64,
    /// Radians.
    pub yaw: f64,
}

impl MinimapPosition {
    pub fn unpack(packed: u32) -> Self {
        let raw = RawMinimapPosition::from_bytes(packed.to_le_bytes());
        MinimapPosition {
            x: unpack_value(raw.x() as u64, 11, -MINIMAP_EXTENT, MINIMAP_EXTENT),
            y: unpack_value(raw.y() as u64, 11, -MINIMAP_EXTENT, MINIMAP_EXTENT),
            yaw: unpack_value(
                raw.yaw() as u64,
                8,
                -std::f64::consts::PI,
                std::f64::consts::PI,
            ),
        }
    }

    /// The ship is no longer on the minimap; only its visibility changes.
    pub fn is_hidden(&self) -> bool {
        self.x == HIDDEN_POSITION.0 && self.y == HIDDEN_POSITION.1
    }
}

#[bitfield]
#[derive(Debug, Clone, Copy)]
struct RawPlaneId {
    owner_id: B32,
    index: B3,
    purpose: B3,
    departures: B1,
    #[skip]
    __: B25,
}

/// Squadron id as packed by the server: owner, squadron index, purpose and
/// departure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlaneId {
    pub owner_id: u32,
    pub index: u8,
    pub purpose: u8,
    pub departures: u8,
}

impl PlaneId {
    pub fn unpack(packed: u64) -> Self {
        let raw = RawPlaneId::from_bytes(packed.to_le_bytes());
        PlaneId {
            owner_id: raw.owner_id(),
            index: raw.index(),
            purpose: raw.purpose(),
            departures: raw.departures(),
        }
    }
}
