pub mod occupancy;

pub use occupancy::RouteGrid;

use gridroute_common::db::indices::NetId;

/// Who holds a grid cell. Sentinels and real nets share one closed type so
/// a cell can never be both obstructed and owned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// Routable and currently empty.
    Free,
    /// Unroutable: pin or library obstruction.
    Obstructed,
    /// Power rail.
    Power,
    /// Ground rail.
    Ground,
    Net(NetId),
}

/// Compass blockage bits inherited from offset pin taps. A set bit means
/// the neighbouring cell in that direction must not terminate a foreign
/// route (the tap's contact will be shifted toward it).
pub const BLOCK_NORTH: u8 = 0x01;
pub const BLOCK_SOUTH: u8 = 0x02;
pub const BLOCK_EAST: u8 = 0x04;
pub const BLOCK_WEST: u8 = 0x08;

/// Per-layer "adjacent track must be blocked" bits, derived from wire and
/// via widths against pitch and spacing.
pub const ROUTE_BLOCK_X: u8 = 0x01;
pub const ROUTE_BLOCK_Y: u8 = 0x02;
pub const VIA_BLOCK_X: u8 = 0x04;
pub const VIA_BLOCK_Y: u8 = 0x08;

/// One occupancy cell.
#[derive(Clone, Copy, Debug)]
pub struct Cell {
    pub owner: Owner,
    /// Directional blockage bits; survive rip-up so pin geometry is never
    /// lost.
    pub block: u8,
    /// Set on cells written during this routing session, including the
    /// spacing blockages placed next to wide wires.
    pub routed: bool,
    /// The cell terminates on an off-grid tap; the stub array holds the
    /// shift distance.
    pub offset_tap: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            owner: Owner::Free,
            block: 0,
            routed: false,
            offset_tap: false,
        }
    }
}
