use super::{Cell, Owner, ROUTE_BLOCK_X, ROUTE_BLOCK_Y, VIA_BLOCK_X, VIA_BLOCK_Y};
use crate::RouteError;
use gridroute_common::db::core::{LayerDirection, RouterDB};
use gridroute_common::db::defout::GridFrame;
use gridroute_common::db::indices::NodeId;
use gridroute_common::geom::coord::GridCoord;
use gridroute_common::geom::point::Point;

/// The dense per-layer occupancy map. All layers share one column/row frame:
/// parallel layers declared at different pitches collapse onto the tightest
/// pitch (reported once).
pub struct RouteGrid {
    nx: i32,
    ny: i32,
    layers: u8,
    pitch_x: f64,
    pitch_y: f64,
    origin: Point<f64>,

    cells: Vec<Cell>,
    /// Stub shift distances; meaningful only where `offset_tap` is set.
    stub: Vec<f64>,
    /// Node occupying each cell while it still costs crossovers; cleared
    /// for a node once it has been routed.
    node_at: Vec<Option<NodeId>>,
    /// Permanent node record; used to restore `node_at` on rip-up and to
    /// forbid routing over terminals in stage 2.
    node_sav: Vec<Option<NodeId>>,
    /// Commit counts per cell, for the congestion report.
    usage: Vec<u32>,

    /// Adjacent-track blockage requirements per layer.
    need_block: Vec<u8>,
}

impl RouteGrid {
    /// Build the grid for a loaded design. TRACKS declarations are
    /// authoritative for pitch and origin; the layer pitch from the library
    /// is the fallback.
    pub fn build(db: &RouterDB) -> Result<Self, RouteError> {
        if db.layers.is_empty() {
            return Err(RouteError::EmptyGrid);
        }

        let mut pitch_x = f64::MAX;
        let mut pitch_y = f64::MAX;
        let mut origin_x: Option<f64> = None;
        let mut origin_y: Option<f64> = None;
        let mut mismatch = false;

        for track in &db.tracks {
            if track.step <= 0.0 {
                continue;
            }
            match track.axis.as_str() {
                "X" => {
                    if pitch_x != f64::MAX && (pitch_x - track.step).abs() > 1e-9 {
                        mismatch = true;
                    }
                    if track.step < pitch_x {
                        pitch_x = track.step;
                        origin_x = Some(track.start);
                    }
                }
                "Y" => {
                    if pitch_y != f64::MAX && (pitch_y - track.step).abs() > 1e-9 {
                        mismatch = true;
                    }
                    if track.step < pitch_y {
                        pitch_y = track.step;
                        origin_y = Some(track.start);
                    }
                }
                _ => {}
            }
        }

        // Library fallback for axes with no track declarations.
        if pitch_x == f64::MAX {
            for layer in &db.layers {
                if layer.direction == LayerDirection::Vertical && layer.pitch_x > 0.0 {
                    pitch_x = pitch_x.min(layer.pitch_x);
                }
            }
        }
        if pitch_y == f64::MAX {
            for layer in &db.layers {
                if layer.direction == LayerDirection::Horizontal && layer.pitch_y.max(layer.pitch_x) > 0.0 {
                    pitch_y = pitch_y.min(layer.pitch_y.max(layer.pitch_x));
                }
            }
        }
        if pitch_x == f64::MAX {
            pitch_x = pitch_y;
        }
        if pitch_y == f64::MAX {
            pitch_y = pitch_x;
        }
        if !(pitch_x.is_finite() && pitch_x > 0.0 && pitch_y > 0.0) {
            return Err(RouteError::EmptyGrid);
        }
        if mismatch {
            log::warn!(
                "parallel layers at different pitches; using tightest ({:.3} x {:.3})",
                pitch_x,
                pitch_y
            );
        }

        let origin = Point::new(
            origin_x.unwrap_or(db.die_area.min.x),
            origin_y.unwrap_or(db.die_area.min.y),
        );
        let nx = (((db.die_area.max.x - origin.x) / pitch_x).floor() as i32 + 1).max(1);
        let ny = (((db.die_area.max.y - origin.y) / pitch_y).floor() as i32 + 1).max(1);
        let layers = db.layers.len() as u8;
        let size = nx as usize * ny as usize * layers as usize;

        log::info!(
            "routing grid: {} x {} x {} (pitch {:.3} x {:.3})",
            nx,
            ny,
            layers,
            pitch_x,
            pitch_y
        );

        let need_block = derive_need_block(db);

        Ok(Self {
            nx,
            ny,
            layers,
            pitch_x,
            pitch_y,
            origin,
            cells: vec![Cell::default(); size],
            stub: vec![0.0; size],
            node_at: vec![None; size],
            node_sav: vec![None; size],
            usage: vec![0; size],
            need_block,
        })
    }

    pub fn nx(&self) -> i32 {
        self.nx
    }
    pub fn ny(&self) -> i32 {
        self.ny
    }
    pub fn num_layers(&self) -> u8 {
        self.layers
    }
    pub fn len(&self) -> usize {
        self.cells.len()
    }
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn frame(&self) -> GridFrame {
        GridFrame {
            origin: self.origin,
            pitch_x: self.pitch_x,
            pitch_y: self.pitch_y,
        }
    }

    #[inline(always)]
    pub fn in_bounds(&self, c: GridCoord) -> bool {
        c.x >= 0 && c.x < self.nx && c.y >= 0 && c.y < self.ny && c.layer < self.layers
    }

    #[inline(always)]
    pub fn index(&self, c: GridCoord) -> usize {
        (c.layer as usize) * (self.nx as usize) * (self.ny as usize)
            + (c.y as usize) * (self.nx as usize)
            + (c.x as usize)
    }

    #[inline(always)]
    pub fn coord_of(&self, idx: usize) -> GridCoord {
        let plane = self.nx as usize * self.ny as usize;
        GridCoord::new(
            (idx % self.nx as usize) as i32,
            ((idx % plane) / self.nx as usize) as i32,
            (idx / plane) as u8,
        )
    }

    /// Physical centre of a grid cell.
    pub fn to_phys(&self, c: GridCoord) -> Point<f64> {
        self.frame().to_phys(c.x, c.y)
    }

    /// Nearest grid cell to a physical point, clamped onto the die.
    pub fn to_grid(&self, p: Point<f64>, layer: u8) -> GridCoord {
        let x = ((p.x - self.origin.x) / self.pitch_x).round() as i32;
        let y = ((p.y - self.origin.y) / self.pitch_y).round() as i32;
        GridCoord::new(x.clamp(0, self.nx - 1), y.clamp(0, self.ny - 1), layer)
    }

    /// Grid column/row of a physical point without clamping; may land
    /// outside the die.
    pub fn to_grid_unclamped(&self, p: Point<f64>, layer: u8) -> GridCoord {
        GridCoord::new(
            ((p.x - self.origin.x) / self.pitch_x).round() as i32,
            ((p.y - self.origin.y) / self.pitch_y).round() as i32,
            layer,
        )
    }

    #[inline(always)]
    pub fn cell(&self, c: GridCoord) -> Cell {
        self.cells[self.index(c)]
    }

    #[inline(always)]
    pub fn cell_mut(&mut self, c: GridCoord) -> &mut Cell {
        let idx = self.index(c);
        &mut self.cells[idx]
    }

    #[inline(always)]
    pub fn owner(&self, c: GridCoord) -> Owner {
        self.cells[self.index(c)].owner
    }

    pub fn stub(&self, c: GridCoord) -> f64 {
        self.stub[self.index(c)]
    }

    pub fn set_stub(&mut self, c: GridCoord, dist: f64) {
        let idx = self.index(c);
        self.stub[idx] = dist;
    }

    pub fn node_at(&self, c: GridCoord) -> Option<NodeId> {
        self.node_at[self.index(c)]
    }

    pub fn node_reserved(&self, c: GridCoord) -> Option<NodeId> {
        self.node_sav[self.index(c)]
    }

    pub fn set_node(&mut self, c: GridCoord, node: NodeId) {
        let idx = self.index(c);
        self.node_at[idx] = Some(node);
        self.node_sav[idx] = Some(node);
    }

    /// Stop charging crossover costs for this node (it is being routed).
    pub fn clear_node_cost(&mut self, c: GridCoord) {
        let idx = self.index(c);
        self.node_at[idx] = None;
    }

    /// Re-attach the permanent node record, restoring crossover costs.
    pub fn restore_node_cost(&mut self, c: GridCoord) {
        let idx = self.index(c);
        self.node_at[idx] = self.node_sav[idx];
    }

    pub fn need_block(&self, layer: u8) -> u8 {
        self.need_block[layer as usize]
    }

    pub fn add_usage(&mut self, c: GridCoord) {
        let idx = self.index(c);
        self.usage[idx] += 1;
    }

    /// Cells with the highest commit counts, descending; ties by index so
    /// the report is stable.
    pub fn congestion(&self, limit: usize) -> Vec<(GridCoord, u32)> {
        let mut cells: Vec<(usize, u32)> = self
            .usage
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n > 1)
            .map(|(i, &n)| (i, n))
            .collect();
        cells.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        cells
            .into_iter()
            .take(limit)
            .map(|(i, n)| (self.coord_of(i), n))
            .collect()
    }
}

/// Compare wire and via widths against pitch and spacing to decide which
/// layers must block the neighbouring track alongside committed geometry.
fn derive_need_block(db: &RouterDB) -> Vec<u8> {
    let mut need = vec![0u8; db.layers.len()];
    for (i, layer) in db.layers.iter().enumerate() {
        let spacing = layer.spacing.lookup(layer.width);
        let pitch_x = if layer.pitch_x > 0.0 { layer.pitch_x } else { layer.pitch_y };
        let pitch_y = if layer.pitch_y > 0.0 { layer.pitch_y } else { layer.pitch_x };

        if layer.width + spacing > pitch_x && pitch_x > 0.0 {
            need[i] |= ROUTE_BLOCK_X;
        }
        if layer.width + spacing > pitch_y && pitch_y > 0.0 {
            need[i] |= ROUTE_BLOCK_Y;
        }

        // Widest via footprint landing on this layer.
        let mut via_w: f64 = 0.0;
        let mut via_h: f64 = 0.0;
        for via in &db.vias {
            if let Some(fp) = via.footprint(i as u8) {
                via_w = via_w.max(fp.width());
                via_h = via_h.max(fp.height());
            }
        }
        if via_w > 0.0 && (via_w + layer.width) / 2.0 + spacing > pitch_x && pitch_x > 0.0 {
            need[i] |= VIA_BLOCK_X;
        }
        if via_h > 0.0 && (via_h + layer.width) / 2.0 + spacing > pitch_y && pitch_y > 0.0 {
            need[i] |= VIA_BLOCK_Y;
        }
    }
    need
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridroute_common::db::core::{LayerData, NetClass, SpacingRule, TrackDef};
    use gridroute_common::geom::rect::Rect;

    fn tiny_db() -> RouterDB {
        let mut db = RouterDB::new();
        db.die_area = Rect::from_corners(0.0, 0.0, 10.0, 10.0);
        for (name, dir) in [
            ("metal1", LayerDirection::Horizontal),
            ("metal2", LayerDirection::Vertical),
        ] {
            db.add_layer(LayerData {
                name: name.to_string(),
                index: 0,
                direction: dir,
                pitch_x: 1.0,
                pitch_y: 1.0,
                width: 0.4,
                spacing: SpacingRule::new(0.4),
                offset: 0.5,
            });
        }
        db.tracks.push(TrackDef {
            layer: "metal2".to_string(),
            axis: "X".to_string(),
            start: 0.5,
            step: 1.0,
            count: 10,
        });
        db.tracks.push(TrackDef {
            layer: "metal1".to_string(),
            axis: "Y".to_string(),
            start: 0.5,
            step: 1.0,
            count: 10,
        });
        db.add_net("n1", NetClass::Signal);
        db
    }

    #[test]
    fn builds_from_tracks() {
        let grid = RouteGrid::build(&tiny_db()).unwrap();
        assert_eq!(grid.num_layers(), 2);
        assert_eq!(grid.nx(), 10);
        assert_eq!(grid.ny(), 10);
        let p = grid.to_phys(GridCoord::new(0, 0, 0));
        assert!((p.x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn index_roundtrip() {
        let grid = RouteGrid::build(&tiny_db()).unwrap();
        let c = GridCoord::new(3, 7, 1);
        assert_eq!(grid.coord_of(grid.index(c)), c);
    }

    #[test]
    fn phys_grid_roundtrip() {
        let grid = RouteGrid::build(&tiny_db()).unwrap();
        let c = GridCoord::new(4, 2, 0);
        assert_eq!(grid.to_grid(grid.to_phys(c), 0), c);
    }

    #[test]
    fn wide_wires_demand_adjacent_blockage() {
        let mut db = tiny_db();
        db.layers[0].width = 0.7; // 0.7 + 0.4 spacing > 1.0 pitch
        let grid = RouteGrid::build(&db).unwrap();
        assert_ne!(grid.need_block(0) & (ROUTE_BLOCK_X | ROUTE_BLOCK_Y), 0);
        assert_eq!(grid.need_block(1), 0);
    }
}
