use crate::grid::{Owner, RouteGrid, BLOCK_EAST, BLOCK_NORTH, BLOCK_SOUTH, BLOCK_WEST};
use crate::net_owner;
use gridroute_common::db::core::{LayerRect, NetClass, RouterDB, Tap};
use gridroute_common::db::indices::{NetId, NodeId};
use gridroute_common::geom::coord::{Dir, GridCoord};
use gridroute_common::geom::rect::Rect;
use gridroute_common::util::config::Config;

/// Annotate the netlist from the configuration, then rasterise every pin,
/// obstruction and pre-route onto the occupancy grid and resolve node taps.
pub fn prepare(db: &mut RouterDB, grid: &mut RouteGrid, config: &Config) {
    classify_nets(db, config);
    paint_obstructions(db, grid, config);
    paint_prewires(db, grid);
    resolve_taps(db, grid);
}

fn classify_nets(db: &mut RouterDB, config: &Config) {
    for net in &mut db.nets {
        if net.name == config.router.vdd {
            net.class = NetClass::Power;
        } else if net.name == config.router.gnd {
            net.class = NetClass::Ground;
        }
        if config.router.ignore.iter().any(|n| *n == net.name) {
            net.ignored = true;
        }
        if config.router.priority.iter().any(|n| *n == net.name) {
            net.critical = true;
        }
    }

    let ignored: Vec<&str> = db
        .nets
        .iter()
        .filter(|n| n.ignored)
        .map(|n| n.name.as_str())
        .collect();
    if !ignored.is_empty() {
        log::info!("ignored nets: {}", ignored.join(" "));
    }
    let critical: Vec<&str> = db
        .nets
        .iter()
        .filter(|n| n.critical)
        .map(|n| n.name.as_str())
        .collect();
    if !critical.is_empty() {
        log::info!("priority nets: {}", critical.join(" "));
    }
}

/// The keep-out halo around pin geometry on a layer: a grid cell whose
/// centre falls inside it is close enough to reach the pin with an offset
/// contact, and too close for a foreign wire.
fn halo(db: &RouterDB, layer: u8) -> f64 {
    let l = &db.layers[layer as usize];
    l.spacing.lookup(l.width) + l.width / 2.0
}

/// Mark every grid cell whose centre falls inside `rect` (grown by
/// `margin`) on `layer`.
fn for_cells_in(
    grid: &RouteGrid,
    rect: Rect,
    margin: f64,
    layer: u8,
    mut f: impl FnMut(GridCoord),
) {
    let r = rect.expanded(margin);
    let lo = grid.to_grid_unclamped(r.min, layer);
    let hi = grid.to_grid_unclamped(r.max, layer);
    for y in lo.y - 1..=hi.y + 1 {
        for x in lo.x - 1..=hi.x + 1 {
            let c = GridCoord::new(x, y, layer);
            if grid.in_bounds(c) && r.contains(grid.to_phys(c)) {
                f(c);
            }
        }
    }
}

fn paint_obstructions(db: &RouterDB, grid: &mut RouteGrid, config: &Config) {
    // User keep-outs from the configuration.
    for obs in &config.obstruction {
        match db.find_layer(&obs.layer) {
            Some(layer) => {
                let rect = Rect::from_corners(obs.x1, obs.y1, obs.x2, obs.y2);
                obstruct_rect(grid, LayerRect { layer, rect }, 0.0);
            }
            None => log::warn!("obstruction on unknown layer '{}' ignored", obs.layer),
        }
    }

    // Routing blockages from the layout.
    for lr in &db.blockages {
        obstruct_rect(grid, *lr, 0.0);
    }

    // Macro obstruction geometry, with the layer halo so wires cannot
    // brush against it.
    for gate in &db.gates {
        let mac = match gate.macro_id {
            Some(id) => &db.macros[id.index()],
            None => continue,
        };
        for lr in &mac.obs {
            let placed = gate
                .orient
                .place(lr.rect, (mac.width, mac.height), gate.origin);
            let h = halo(db, lr.layer);
            obstruct_rect(
                grid,
                LayerRect {
                    layer: lr.layer,
                    rect: placed,
                },
                h,
            );
        }
    }
}

fn obstruct_rect(grid: &mut RouteGrid, lr: LayerRect, margin: f64) {
    let mut cells = Vec::new();
    for_cells_in(grid, lr.rect, margin, lr.layer, |c| cells.push(c));
    for c in cells {
        let cell = grid.cell_mut(c);
        if cell.owner == Owner::Free {
            cell.owner = Owner::Obstructed;
        }
    }
}

/// Paint pre-routed geometry from the layout input. Power and ground
/// wiring becomes rail ownership; signal pre-routes claim their cells for
/// the net without the routed-this-session bit.
fn paint_prewires(db: &RouterDB, grid: &mut RouteGrid) {
    for (i, net) in db.nets.iter().enumerate() {
        if net.prewires.is_empty() {
            continue;
        }
        let owner = match net.class {
            NetClass::Power => Owner::Power,
            NetClass::Ground => Owner::Ground,
            NetClass::Signal => Owner::Net(NetId::new(i)),
        };
        for pw in &net.prewires {
            let rect = Rect::from_corners(pw.a.x, pw.a.y, pw.b.x, pw.b.y).expanded(pw.width / 2.0);
            let mut cells = Vec::new();
            for_cells_in(grid, rect, 0.0, pw.layer, |c| cells.push(c));
            for c in cells {
                let cell = grid.cell_mut(c);
                if cell.owner == Owner::Free {
                    cell.owner = owner;
                }
            }
        }
    }
}

/// Resolve the taps of every node: primary taps where the cell centre lands
/// inside the pin geometry, extended taps inside the keep-out halo, and an
/// offset tap with a stub distance when the pin misses the grid entirely.
fn resolve_taps(db: &mut RouterDB, grid: &mut RouteGrid) {
    for node_idx in 0..db.nodes.len() {
        let node_id = NodeId::new(node_idx);
        let (net_id, rects) = {
            let node = &db.nodes[node_idx];
            let gate = &db.gates[node.gate.index()];
            let rects: Vec<LayerRect> = match (gate.macro_id, gate.io_port.as_ref()) {
                (Some(mid), _) => {
                    let mac = &db.macros[mid.index()];
                    match mac.port(&node.port_name) {
                        Some(port) => port
                            .rects
                            .iter()
                            .map(|lr| LayerRect {
                                layer: lr.layer,
                                rect: gate.orient.place(
                                    lr.rect,
                                    (mac.width, mac.height),
                                    gate.origin,
                                ),
                            })
                            .collect(),
                        None => {
                            log::warn!(
                                "gate '{}' has no port '{}' in macro '{}'",
                                gate.name,
                                node.port_name,
                                mac.name
                            );
                            Vec::new()
                        }
                    }
                }
                (None, Some(port)) => port
                    .rects
                    .iter()
                    .map(|lr| LayerRect {
                        layer: lr.layer,
                        rect: gate.orient.place(lr.rect, (0.0, 0.0), gate.origin),
                    })
                    .collect(),
                (None, None) => Vec::new(),
            };
            (node.net, rects)
        };

        let owner = net_owner(db, net_id);
        let mut taps: Vec<Tap> = Vec::new();
        let mut extend: Vec<Tap> = Vec::new();

        for lr in &rects {
            let h = halo(db, lr.layer);
            resolve_rect(grid, *lr, h, owner, node_id, &mut taps, &mut extend);
        }

        // An off-grid pin still gets a grid contact: the nearest cell is an
        // extended tap whose stub distance shifts the physical via onto the
        // pin.
        if taps.is_empty() && !rects.is_empty() {
            for lr in &rects {
                assign_offset_tap(grid, *lr, owner, node_id, &mut extend);
            }
        }

        for tap in taps.iter().chain(extend.iter()) {
            db.nets[net_id.index()].grow_bbox(tap.loc.x, tap.loc.y);
        }

        let node = &mut db.nodes[node_idx];
        if taps.is_empty() && extend.is_empty() {
            node.unreachable = true;
            let name = &db.nets[net_id.index()].name;
            log::warn!(
                "net '{}': port '{}' has no reachable grid cell",
                name,
                node.port_name
            );
        }
        node.taps = taps;
        node.extend = extend;
    }
}

#[allow(clippy::too_many_arguments)]
fn resolve_rect(
    grid: &mut RouteGrid,
    lr: LayerRect,
    h: f64,
    owner: Owner,
    node_id: NodeId,
    taps: &mut Vec<Tap>,
    extend: &mut Vec<Tap>,
) {
    let center = lr.rect.center();

    let mut primary = Vec::new();
    let mut halo_cells = Vec::new();
    for_cells_in(grid, lr.rect, h, lr.layer, |c| halo_cells.push(c));
    for_cells_in(grid, lr.rect, 0.0, lr.layer, |c| primary.push(c));

    for c in primary {
        let cell = grid.cell(c);
        match cell.owner {
            Owner::Free => {
                grid.cell_mut(c).owner = owner;
                grid.set_node(c, node_id);
                taps.push(Tap {
                    loc: c,
                    physical: center,
                    stub: None,
                });
            }
            o if o == owner => {
                if grid.node_reserved(c).is_none() {
                    grid.set_node(c, node_id);
                }
                if grid.node_reserved(c) == Some(node_id)
                    && !taps.iter().any(|t| t.loc == c)
                {
                    taps.push(Tap {
                        loc: c,
                        physical: center,
                        stub: None,
                    });
                }
            }
            Owner::Net(_) | Owner::Power | Owner::Ground => {
                // Overlapping foreign pin geometry: neither side may use it.
                grid.cell_mut(c).owner = Owner::Obstructed;
            }
            Owner::Obstructed => {}
        }
    }

    for c in halo_cells {
        if taps.iter().any(|t| t.loc == c) {
            continue;
        }
        let cell = grid.cell(c);
        if cell.owner == Owner::Free {
            grid.cell_mut(c).owner = owner;
            grid.set_node(c, node_id);
            extend.push(Tap {
                loc: c,
                physical: center,
                stub: None,
            });
        } else if cell.owner == owner
            && grid.node_reserved(c) == Some(node_id)
            && !extend.iter().any(|t| t.loc == c)
        {
            extend.push(Tap {
                loc: c,
                physical: center,
                stub: None,
            });
        }
    }
}

/// Nearest-cell fallback for pins no grid centre can reach. Marks the cell
/// as an offset tap, records the signed stub distance, and blocks the cell
/// the contact will shift toward.
fn assign_offset_tap(
    grid: &mut RouteGrid,
    lr: LayerRect,
    owner: Owner,
    node_id: NodeId,
    extend: &mut Vec<Tap>,
) {
    let center = lr.rect.center();
    let c = grid.to_grid(center, lr.layer);
    let cell = grid.cell(c);
    if !(cell.owner == Owner::Free || cell.owner == owner) {
        return;
    }

    let phys = grid.to_phys(c);
    let dx = center.x - phys.x;
    let dy = center.y - phys.y;
    let (dir, dist) = if dx.abs() >= dy.abs() {
        (if dx >= 0.0 { Dir::East } else { Dir::West }, dx)
    } else {
        (if dy >= 0.0 { Dir::North } else { Dir::South }, dy)
    };

    {
        let cell = grid.cell_mut(c);
        cell.owner = owner;
        cell.offset_tap = true;
        cell.block |= match dir {
            Dir::North => BLOCK_NORTH,
            Dir::South => BLOCK_SOUTH,
            Dir::East => BLOCK_EAST,
            Dir::West => BLOCK_WEST,
            _ => 0,
        };
    }
    grid.set_stub(c, dist);
    grid.set_node(c, node_id);
    match extend.iter_mut().find(|t| t.loc == c) {
        Some(tap) => tap.stub = Some((dir, dist)),
        None => extend.push(Tap {
            loc: c,
            physical: center,
            stub: Some((dir, dist)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::RouteGrid;
    use gridroute_common::db::core::{
        GateData, LayerData, LayerDirection, MacroDef, Orient, PortDef, PortDirection, PortUse,
        SpacingRule, TrackDef,
    };
    use gridroute_common::geom::point::Point;

    fn test_db() -> RouterDB {
        let mut db = RouterDB::new();
        db.die_area = Rect::from_corners(0.0, 0.0, 20.0, 20.0);
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
                spacing: SpacingRule::new(0.2),
                offset: 0.0,
            });
        }
        for (axis, layer) in [("X", "metal2"), ("Y", "metal1")] {
            db.tracks.push(TrackDef {
                layer: layer.to_string(),
                axis: axis.to_string(),
                start: 0.0,
                step: 1.0,
                count: 21,
            });
        }
        db
    }

    fn add_one_pin_gate(db: &mut RouterDB, name: &str, origin: Point<f64>, rect: Rect) {
        let mid = db.add_macro(MacroDef {
            name: format!("MAC_{}", name),
            width: 4.0,
            height: 4.0,
            obs: Vec::new(),
            ports: Vec::new(),
        });
        db.macros[mid.index()].ports.push(PortDef {
            name: "A".to_string(),
            direction: PortDirection::Input,
            use_class: PortUse::Signal,
            rects: vec![LayerRect { layer: 0, rect }],
        });
        let gid = db.add_gate(GateData {
            name: name.to_string(),
            macro_id: Some(mid),
            io_port: None,
            origin,
            orient: Orient::NORTH,
            nodes: Vec::new(),
        });
        let net = db.add_net(&format!("net_{}", name), NetClass::Signal);
        db.add_node(net, gid, "A");
    }

    #[test]
    fn on_grid_pin_gets_primary_tap() {
        let mut db = test_db();
        // Pin rectangle centred on grid cell (5, 5).
        add_one_pin_gate(
            &mut db,
            "u1",
            Point::new(4.0, 4.0),
            Rect::from_corners(0.7, 0.7, 1.3, 1.3),
        );
        let mut grid = RouteGrid::build(&db).unwrap();
        prepare(&mut db, &mut grid, &Config::default());

        let node = &db.nodes[0];
        assert!(!node.unreachable);
        assert_eq!(node.taps.len(), 1);
        assert_eq!(node.taps[0].loc, GridCoord::new(5, 5, 0));
        assert!(matches!(
            grid.owner(GridCoord::new(5, 5, 0)),
            Owner::Net(_)
        ));
        // Halo (spacing + width/2 = 0.4) is tighter than the pitch, so no
        // neighbouring centre falls in the keep-out.
        assert!(node.extend.is_empty());
    }

    #[test]
    fn off_grid_pin_gets_offset_tap() {
        let mut db = test_db();
        // Tiny pin rectangle between grid centres; no cell centre inside.
        add_one_pin_gate(
            &mut db,
            "u1",
            Point::new(4.0, 4.0),
            Rect::from_corners(1.30, 0.95, 1.42, 1.05),
        );
        let mut grid = RouteGrid::build(&db).unwrap();
        prepare(&mut db, &mut grid, &Config::default());

        let node = &db.nodes[0];
        assert!(node.taps.is_empty());
        let tap = node
            .extend
            .iter()
            .find(|t| t.stub.is_some())
            .expect("offset tap");
        let (dir, dist) = tap.stub.unwrap();
        assert_eq!(dir, Dir::East);
        assert!(dist > 0.0);
        let cell = grid.cell(tap.loc);
        assert!(cell.offset_tap);
        assert_ne!(cell.block & BLOCK_EAST, 0);
    }

    #[test]
    fn overlapping_foreign_pins_become_obstructed() {
        let mut db = test_db();
        let shared = Rect::from_corners(0.7, 0.7, 1.3, 1.3);
        add_one_pin_gate(&mut db, "u1", Point::new(4.0, 4.0), shared);
        add_one_pin_gate(&mut db, "u2", Point::new(4.0, 4.0), shared);
        let mut grid = RouteGrid::build(&db).unwrap();
        prepare(&mut db, &mut grid, &Config::default());

        assert_eq!(grid.owner(GridCoord::new(5, 5, 0)), Owner::Obstructed);
    }
}
