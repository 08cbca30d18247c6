use crate::grid::{
    Owner, RouteGrid, BLOCK_EAST, BLOCK_NORTH, BLOCK_SOUTH, BLOCK_WEST, ROUTE_BLOCK_X,
    ROUTE_BLOCK_Y, VIA_BLOCK_X, VIA_BLOCK_Y,
};
use crate::maze::segment_cells;
use crate::net_owner;
use gridroute_common::db::core::{Route, RouterDB, SegKind, Segment};
use gridroute_common::db::indices::NetId;
use gridroute_common::geom::coord::{Dir, GridCoord};

/// Turn an extracted cell list (target end first) into a route of wire and
/// via segments: collinear same-layer runs coalesce into one wire, vias are
/// emitted one grid cell at a time. Offset flags are read from the grid's
/// pin-geometry bits and propagated across via/wire boundaries. With
/// `immediate` set, ownership and blockages are written back at once; the
/// rip-up stage defers that until collisions have been cleared.
pub fn commit_route(
    db: &RouterDB,
    grid: &mut RouteGrid,
    net: NetId,
    path: &[GridCoord],
    immediate: bool,
) -> Route {
    let mut segments: Vec<Segment> = Vec::new();
    let mut i = 0;
    while i + 1 < path.len() {
        let a = path[i];
        let b = path[i + 1];
        let mut seg = if a.layer != b.layer {
            let s = Segment::via(a.layer.min(b.layer), a.x, a.y);
            i += 1;
            s
        } else {
            let dx = (b.x - a.x).signum();
            let dy = (b.y - a.y).signum();
            let mut j = i + 1;
            while j + 1 < path.len()
                && path[j + 1].layer == a.layer
                && (path[j + 1].x - path[j].x).signum() == dx
                && (path[j + 1].y - path[j].y).signum() == dy
                && path[j + 1].x - path[j].x == b.x - a.x
                && path[j + 1].y - path[j].y == b.y - a.y
            {
                j += 1;
            }
            let s = Segment::wire(a.layer, a.x, a.y, path[j].x, path[j].y);
            i = j;
            s
        };

        // Offset flags: a segment end on an offset tap is physically
        // shifted onto the pin when the layout is written.
        let start_cell = grid.cell(GridCoord::new(seg.x1, seg.y1, seg.layer));
        let end_layer = match seg.kind {
            SegKind::Via => seg.layer + 1,
            SegKind::Wire => seg.layer,
        };
        let end_cell = grid.cell(GridCoord::new(seg.x2, seg.y2, end_layer));
        if start_cell.offset_tap {
            seg.offset_start = true;
            // An offset via carries its shift into the wire it lands on.
            if seg.kind == SegKind::Via {
                if let Some(prev) = segments.last_mut() {
                    if prev.kind == SegKind::Wire {
                        prev.offset_end = true;
                    }
                }
            }
        }
        if end_cell.offset_tap {
            seg.offset_end = true;
        }
        if let Some(prev) = segments.last() {
            if prev.kind == SegKind::Via && prev.offset_end && seg.kind == SegKind::Wire {
                seg.offset_start = true;
            }
        }

        segments.push(seg);
    }

    let route = Route { segments };
    if immediate {
        writeback_route(db, grid, net, &route);
    }
    route
}

/// Write a committed route into the occupancy map: every covered cell gets
/// the net's ownership with the routed-this-session bit, and spacing-driven
/// adjacent-track blockages are placed alongside.
pub fn writeback_route(db: &RouterDB, grid: &mut RouteGrid, net: NetId, route: &Route) {
    for seg in &route.segments {
        writeback_segment(db, grid, net, seg);
    }
}

fn writeback_segment(db: &RouterDB, grid: &mut RouteGrid, net: NetId, seg: &Segment) {
    let owner = net_owner(db, net);
    let net_name = &db.nets[net.index()].name;

    for c in segment_cells(seg) {
        if !grid.in_bounds(c) {
            continue;
        }
        {
            let cell = grid.cell_mut(c);
            match cell.owner {
                Owner::Free | Owner::Obstructed => {
                    // Obstructed cells appear only on forced offset-tap
                    // routes; the directional bits are kept so rip-up can
                    // restore the geometry.
                    cell.owner = owner;
                    cell.routed = true;
                }
                o if o == owner => {
                    cell.routed = true;
                }
                other => {
                    log::error!(
                        "net '{}': cell ({}, {}, {}) already held by {:?} at commit",
                        net_name,
                        c.x,
                        c.y,
                        c.layer,
                        other
                    );
                    continue;
                }
            }
        }
        grid.add_usage(c);
    }

    match seg.kind {
        SegKind::Wire => {
            let horizontal = seg.y1 == seg.y2;
            let need = grid.need_block(seg.layer);
            for c in segment_cells(seg) {
                if horizontal && need & ROUTE_BLOCK_Y != 0 {
                    block_adjacent(grid, Dir::North.step(c));
                    block_adjacent(grid, Dir::South.step(c));
                }
                if (!horizontal || seg.x1 == seg.x2) && need & ROUTE_BLOCK_X != 0 {
                    block_adjacent(grid, Dir::East.step(c));
                    block_adjacent(grid, Dir::West.step(c));
                }
            }
        }
        SegKind::Via => {
            for layer in [seg.layer, seg.layer + 1] {
                let c = GridCoord::new(seg.x1, seg.y1, layer);
                if !grid.in_bounds(c) {
                    continue;
                }
                let need = grid.need_block(layer);
                if need & VIA_BLOCK_X != 0 {
                    block_adjacent(grid, Dir::East.step(c));
                    block_adjacent(grid, Dir::West.step(c));
                }
                if need & VIA_BLOCK_Y != 0 {
                    block_adjacent(grid, Dir::North.step(c));
                    block_adjacent(grid, Dir::South.step(c));
                }
            }
            // A via on an offset tap crowds the cell it shifts toward, on
            // both joined layers.
            let base = GridCoord::new(seg.x1, seg.y1, seg.layer);
            let cell = grid.cell(base);
            if cell.offset_tap {
                for (bit, dir) in [
                    (BLOCK_NORTH, Dir::North),
                    (BLOCK_SOUTH, Dir::South),
                    (BLOCK_EAST, Dir::East),
                    (BLOCK_WEST, Dir::West),
                ] {
                    if cell.block & bit != 0 {
                        block_adjacent(grid, dir.step(base));
                        block_adjacent(grid, dir.step(GridCoord::new(seg.x1, seg.y1, seg.layer + 1)));
                    }
                }
            }
        }
    }
}

/// Mark a free neighbouring cell as held by the session ("no net, routed"):
/// searches treat it as occupied, and rip-up can tell it apart from a real
/// obstruction.
fn block_adjacent(grid: &mut RouteGrid, c: GridCoord) {
    if !grid.in_bounds(c) {
        return;
    }
    let cell = grid.cell_mut(c);
    if cell.owner == Owner::Free && !cell.routed {
        cell.routed = true;
    }
}

/// Rip up every committed route of a net: covered cells return to "no net"
/// (keeping any directional pin-geometry bits), session blockage markers on
/// adjacent tracks are lifted, and with `restore` set the node records are
/// re-attached so crossover costs apply again.
pub fn ripup_net(db: &mut RouterDB, grid: &mut RouteGrid, net: NetId, restore: bool) {
    let routes = std::mem::take(&mut db.nets[net.index()].routes);
    let owner = net_owner(db, net);

    for route in &routes {
        for seg in &route.segments {
            for c in segment_cells(seg) {
                if !grid.in_bounds(c) {
                    continue;
                }
                let current = grid.cell(c).owner;
                if current != owner {
                    if matches!(current, Owner::Net(_)) {
                        log::error!(
                            "rip-up of '{}' found cell ({}, {}, {}) held by {:?}",
                            db.nets[net.index()].name,
                            c.x,
                            c.y,
                            c.layer,
                            current
                        );
                    }
                    continue;
                }
                if grid.node_reserved(c).is_none() {
                    let cell = grid.cell_mut(c);
                    cell.owner = Owner::Free;
                    cell.routed = false;
                } else {
                    grid.cell_mut(c).routed = false;
                }

                // Lift the spacing blockages this route placed alongside.
                let need = grid.need_block(c.layer);
                if need & (ROUTE_BLOCK_X | VIA_BLOCK_X) != 0 {
                    unblock_adjacent(grid, Dir::East.step(c));
                    unblock_adjacent(grid, Dir::West.step(c));
                }
                if need & (ROUTE_BLOCK_Y | VIA_BLOCK_Y) != 0 {
                    unblock_adjacent(grid, Dir::North.step(c));
                    unblock_adjacent(grid, Dir::South.step(c));
                }
            }
        }
    }

    if restore {
        let node_ids = db.nets[net.index()].nodes.clone();
        for node_id in node_ids {
            let node = &db.nodes[node_id.index()];
            for tap in node.taps.iter().chain(node.extend.iter()) {
                if grid.in_bounds(tap.loc) {
                    grid.restore_node_cost(tap.loc);
                }
            }
        }
    }
}

/// Cells marked "no net, routed" next to a ripped route go back to plain
/// "no net"; true obstructions are untouched.
fn unblock_adjacent(grid: &mut RouteGrid, c: GridCoord) {
    if !grid.in_bounds(c) {
        return;
    }
    let cell = grid.cell_mut(c);
    if cell.owner == Owner::Free && cell.routed {
        cell.routed = false;
    }
}

/// Once a net is fully routed its taps no longer need crossover
/// protection.
pub fn release_node_costs(db: &RouterDB, grid: &mut RouteGrid, net: NetId) {
    for &node_id in &db.nets[net.index()].nodes {
        let node = &db.nodes[node_id.index()];
        for tap in node.taps.iter().chain(node.extend.iter()) {
            if grid.in_bounds(tap.loc) {
                grid.clear_node_cost(tap.loc);
            }
        }
    }
}

/// Foreign nets whose cells this net's committed (but not yet written
/// back) routes pass through, in first-encounter order.
pub fn find_colliding(db: &RouterDB, grid: &RouteGrid, net: NetId) -> Vec<NetId> {
    let mut colliding: Vec<NetId> = Vec::new();
    for route in &db.nets[net.index()].routes {
        for seg in &route.segments {
            for c in segment_cells(seg) {
                if !grid.in_bounds(c) {
                    continue;
                }
                if let Owner::Net(k) = grid.owner(c) {
                    if k != net && !colliding.contains(&k) {
                        colliding.push(k);
                    }
                }
            }
        }
    }
    if !colliding.is_empty() {
        let names: Vec<&str> = colliding
            .iter()
            .map(|&k| db.nets[k.index()].name.as_str())
            .collect();
        log::info!(
            "best route of '{}' collides with: {}",
            db.nets[net.index()].name,
            names.join(" ")
        );
    }
    colliding
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridroute_common::db::core::{
        LayerData, LayerDirection, NetClass, SpacingRule, TrackDef,
    };
    use gridroute_common::geom::rect::Rect;

    fn grid_and_db() -> (RouterDB, RouteGrid) {
        let mut db = RouterDB::new();
        db.die_area = Rect::from_corners(0.0, 0.0, 10.0, 10.0);
        for (name, dir) in [
            ("metal1", LayerDirection::Horizontal),
            ("metal2", LayerDirection::Vertical),
            ("metal3", LayerDirection::Horizontal),
        ] {
            db.add_layer(LayerData {
                name: name.to_string(),
                index: 0,
                direction: dir,
                pitch_x: 1.0,
                pitch_y: 1.0,
                width: 0.4,
                spacing: SpacingRule::new(0.2),
                offset: 0.0,
            });
        }
        for axis in ["X", "Y"] {
            db.tracks.push(TrackDef {
                layer: "metal1".to_string(),
                axis: axis.to_string(),
                start: 0.0,
                step: 1.0,
                count: 11,
            });
        }
        db.add_net("n1", NetClass::Signal);
        let grid = RouteGrid::build(&db).unwrap();
        (db, grid)
    }

    #[test]
    fn coalesces_collinear_runs() {
        let (db, mut grid) = grid_and_db();
        let net = db.find_net("n1").unwrap();
        let path = vec![
            GridCoord::new(5, 2, 0),
            GridCoord::new(4, 2, 0),
            GridCoord::new(3, 2, 0),
            GridCoord::new(3, 2, 1),
            GridCoord::new(3, 3, 1),
            GridCoord::new(3, 4, 1),
        ];
        let route = commit_route(&db, &mut grid, net, &path, false);

        let segments = &route.segments;
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].kind, SegKind::Wire);
        assert_eq!((segments[0].x1, segments[0].x2), (5, 3));
        assert_eq!(segments[1].kind, SegKind::Via);
        assert_eq!(segments[2].kind, SegKind::Wire);
        assert_eq!((segments[2].y1, segments[2].y2), (2, 4));
    }

    #[test]
    fn immediate_commit_claims_cells_and_ripup_frees_them() {
        let (mut db, mut grid) = grid_and_db();
        let net = db.find_net("n1").unwrap();
        let path = vec![
            GridCoord::new(6, 2, 0),
            GridCoord::new(5, 2, 0),
            GridCoord::new(4, 2, 0),
        ];
        let route = commit_route(&db, &mut grid, net, &path, true);
        db.nets[net.index()].routes.push(route);

        for x in 4..=6 {
            let cell = grid.cell(GridCoord::new(x, 2, 0));
            assert_eq!(cell.owner, Owner::Net(net));
            assert!(cell.routed);
        }

        ripup_net(&mut db, &mut grid, net, true);
        for x in 4..=6 {
            let cell = grid.cell(GridCoord::new(x, 2, 0));
            assert_eq!(cell.owner, Owner::Free);
            assert!(!cell.routed);
        }
        assert!(db.nets[net.index()].routes.is_empty());
    }

    #[test]
    fn segment_cells_cover_both_via_layers() {
        let via = Segment::via(1, 4, 7);
        let cells = segment_cells(&via);
        assert_eq!(cells.len(), 2);
        assert!(cells.contains(&GridCoord::new(4, 7, 1)));
        assert!(cells.contains(&GridCoord::new(4, 7, 2)));
    }
}
