use gridroute_common::db::core::{
    GateData, LayerData, LayerDirection, NetClass, Orient, PortDef, PortDirection, PortUse,
    PreWire, RouterDB, SegKind, Segment, SpacingRule, TrackDef,
};
use gridroute_common::geom::coord::GridCoord;
use gridroute_common::geom::point::Point;
use gridroute_common::geom::rect::Rect;
use gridroute_common::util::check;
use gridroute_common::util::config::Config;
use gridroute_common::db::core::LayerRect;
use gridroute_router::frontier::{F_SOURCE, F_TARGET};
use gridroute_router::grid::Owner;
use gridroute_router::maze::{Maze, Stage};
use gridroute_router::Router;

/// A die of `size` x `size` microns with unit pitch tracks starting at the
/// origin, one routing layer per entry in `dirs`.
fn make_db(size: f64, dirs: &[LayerDirection]) -> RouterDB {
    let mut db = RouterDB::new();
    db.design_name = "scenario".to_string();
    db.die_area = Rect::from_corners(0.0, 0.0, size, size);
    for (i, &dir) in dirs.iter().enumerate() {
        db.add_layer(LayerData {
            name: format!("metal{}", i + 1),
            index: 0,
            direction: dir,
            pitch_x: 1.0,
            pitch_y: 1.0,
            width: 0.4,
            spacing: SpacingRule::new(0.2),
            offset: 0.0,
        });
    }
    let count = size as u32 + 1;
    for axis in ["X", "Y"] {
        db.tracks.push(TrackDef {
            layer: "metal1".to_string(),
            axis: axis.to_string(),
            start: 0.0,
            step: 1.0,
            count,
        });
    }
    db
}

/// A top-level pin whose rectangle is centred on grid cell (x, y).
fn add_pin(db: &mut RouterDB, name: &str, net: &str, x: f64, y: f64, layer: u8) {
    let gate = db.add_gate(GateData {
        name: name.to_string(),
        macro_id: None,
        io_port: Some(PortDef {
            name: name.to_string(),
            direction: PortDirection::Bidirectional,
            use_class: PortUse::Signal,
            rects: vec![LayerRect {
                layer,
                rect: Rect::from_corners(-0.2, -0.2, 0.2, 0.2),
            }],
        }),
        origin: Point::new(x, y),
        orient: Orient::NORTH,
        nodes: Vec::new(),
    });
    let net_id = db.add_net(net, NetClass::Signal);
    db.add_node(net_id, gate, name);
}

fn wire_length(segments: &[Segment]) -> i32 {
    segments
        .iter()
        .filter(|s| s.kind == SegKind::Wire)
        .map(|s| (s.x2 - s.x1).abs() + (s.y2 - s.y1).abs())
        .sum()
}

/// Drive the maze engine directly and return the accumulated cost at the
/// target it reaches.
fn search_cost(db: RouterDB, net_name: &str) -> u32 {
    let mut router = Router::new(db, Config::default()).unwrap();
    router.search.reset();
    let net = router.db.find_net(net_name).unwrap();
    let nodes = router.db.nets[net.index()].nodes.clone();
    let mut maze = Maze::new(
        &router.db,
        &router.grid,
        &mut router.search,
        &router.config.costs,
        None,
        net,
        Stage::First,
    );
    maze.seed_node(nodes[0], F_SOURCE);
    for &t in &nodes[1..] {
        maze.seed_node(t, F_TARGET);
    }
    let target = maze.find_path().unwrap();
    let idx = maze.grid.index(target);
    maze.search.cost(idx)
}

#[test]
fn two_pin_net_on_empty_grid() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 2.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);

    let net = router.db.find_net("n1").unwrap();
    let routes = &router.db.nets[net.index()].routes;
    assert_eq!(routes.len(), 1);
    let segments = &routes[0].segments;
    assert_eq!(segments.len(), 1);
    let seg = segments[0];
    assert_eq!(seg.kind, SegKind::Wire);
    assert_eq!(seg.layer, 0);
    assert_eq!(seg.y1, 2);
    assert_eq!(seg.y2, 2);
    assert_eq!(seg.x1.min(seg.x2), 2);
    assert_eq!(seg.x1.max(seg.x2), 10);

    // Every covered cell belongs to the net with the session bit set.
    for x in 2..=10 {
        let cell = router.grid.cell(GridCoord::new(x, 2, 0));
        assert_eq!(cell.owner, Owner::Net(net));
        assert!(cell.routed || router.grid.node_reserved(GridCoord::new(x, 2, 0)).is_some());
    }
}

#[test]
fn straight_wire_costs_eight_segments() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 2.0, 0);
    assert_eq!(search_cost(db, "n1"), 8);
}

#[test]
fn net_requiring_a_jog() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 5.0, 0);

    // 8 steps in the preferred direction, 3 against it.
    let cost_db = {
        let mut db = make_db(12.0, &[LayerDirection::Horizontal]);
        add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
        add_pin(&mut db, "p2", "n1", 10.0, 5.0, 0);
        db
    };
    assert_eq!(search_cost(cost_db, "n1"), 8 + 3 * 10);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();
    let segments = &router.db.nets[net.index()].routes[0].segments;
    assert!(segments.iter().all(|s| s.layer == 0));
    assert_eq!(wire_length(segments), 11);
}

#[test]
fn net_requiring_a_via() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 2.0, 10.0, 0);

    let cost_db = {
        let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
        add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
        add_pin(&mut db, "p2", "n1", 2.0, 10.0, 0);
        db
    };
    // Up, eight tracks on the vertical layer, down again.
    assert_eq!(search_cost(cost_db, "n1"), 2 * 5 + 8);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();
    let segments = &router.db.nets[net.index()].routes[0].segments;
    assert_eq!(segments.len(), 3);
    let vias: Vec<&Segment> = segments.iter().filter(|s| s.kind == SegKind::Via).collect();
    assert_eq!(vias.len(), 2);
    assert!(vias.iter().all(|v| v.layer == 0 && v.x1 == 2));
    let wire = segments.iter().find(|s| s.kind == SegKind::Wire).unwrap();
    assert_eq!(wire.layer, 1);
    assert_eq!((wire.y1 - wire.y2).abs(), 8);
}

#[test]
fn collision_drives_ripup_and_reroute() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal]);
    add_pin(&mut db, "a1", "a", 2.0, 5.0, 0);
    add_pin(&mut db, "a2", "a", 10.0, 5.0, 0);
    add_pin(&mut db, "b1", "b", 6.0, 2.0, 0);
    add_pin(&mut db, "b2", "b", 6.0, 8.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    // Stage 1 routes the wide net and leaves the crossing net failing.
    let stage1_failing = router.stage1(None);
    assert_eq!(stage1_failing, 1);
    // Stage 2 routes it through, rips up the blocker, and reroutes that.
    assert_eq!(router.stage2(None), 0);

    let a = router.db.find_net("a").unwrap();
    let b = router.db.find_net("b").unwrap();
    assert!(!router.db.nets[a.index()].routes.is_empty());
    assert!(!router.db.nets[b.index()].routes.is_empty());
    // The ripped-up net learned not to disturb the net that displaced it.
    assert!(router.db.nets[a.index()].noripup.contains(&b));

    assert!(check::run(&router.db, router.config.router.max_stack).is_ok());
}

#[test]
fn stacked_via_relief_splits_tall_columns() {
    let mut db = make_db(
        12.0,
        &[
            LayerDirection::Horizontal,
            LayerDirection::Vertical,
            LayerDirection::Horizontal,
            LayerDirection::Vertical,
        ],
    );
    add_pin(&mut db, "p1", "n1", 5.0, 5.0, 0);
    add_pin(&mut db, "p2", "n1", 5.0, 5.0, 3);

    let config = Config::from_toml("[router]\nmax_stack = 2\n").unwrap();
    let mut router = Router::new(db, config).unwrap();
    assert_eq!(router.route(), 0);

    let net = router.db.find_net("n1").unwrap();
    assert!(!router.db.nets[net.index()].routes.is_empty());
    // No via column taller than the configured limit survives.
    assert!(check::run(&router.db, 2).is_ok());
    // The direct stack would have been three vias; the detour spreads them
    // over two columns.
    let segments = &router.db.nets[net.index()].routes[0].segments;
    let via_positions: std::collections::HashSet<(i32, i32)> = segments
        .iter()
        .filter(|s| s.kind == SegKind::Via)
        .map(|s| (s.x1, s.y1))
        .collect();
    assert!(via_positions.len() >= 2);
}

#[test]
fn power_net_routes_to_nearest_rail_cell() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    let vdd = db.add_net("vdd", NetClass::Power);
    db.nets[vdd.index()].prewires.push(PreWire {
        layer: 0,
        a: Point::new(0.0, 10.0),
        b: Point::new(12.0, 10.0),
        width: 0.8,
    });
    add_pin(&mut db, "vp", "vdd", 5.0, 5.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);

    let net = router.db.find_net("vdd").unwrap();
    let routes = &router.db.nets[net.index()].routes;
    assert_eq!(routes.len(), 1);
    // The connection ends on the rail row.
    let touches_rail = routes[0]
        .segments
        .iter()
        .any(|s| s.y1 == 10 || s.y2 == 10);
    assert!(touches_rail);
}

#[test]
fn routing_is_deterministic() {
    let build = || {
        let mut db = make_db(12.0, &[LayerDirection::Horizontal]);
        add_pin(&mut db, "a1", "a", 2.0, 5.0, 0);
        add_pin(&mut db, "a2", "a", 10.0, 5.0, 0);
        add_pin(&mut db, "b1", "b", 6.0, 2.0, 0);
        add_pin(&mut db, "b2", "b", 6.0, 8.0, 0);
        db
    };

    let mut first = Router::new(build(), Config::default()).unwrap();
    first.route();
    // A second stage-2 invocation on the settled design changes nothing.
    let again = first.stage2(None);
    assert_eq!(again, 0);

    let mut second = Router::new(build(), Config::default()).unwrap();
    second.route();

    for i in 0..first.db.num_nets() {
        let lhs: Vec<&Segment> = first.db.nets[i]
            .routes
            .iter()
            .flat_map(|r| r.segments.iter())
            .collect();
        let rhs: Vec<&Segment> = second.db.nets[i]
            .routes
            .iter()
            .flat_map(|r| r.segments.iter())
            .collect();
        assert_eq!(lhs, rhs, "net {} routed differently", first.db.nets[i].name);
    }
}

#[test]
fn ripup_restores_grid_state() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 2.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();

    router.ripup(net);
    assert!(router.db.nets[net.index()].routes.is_empty());
    // Intermediate cells are free again; the pin cells keep their net.
    assert_eq!(router.grid.owner(GridCoord::new(6, 2, 0)), Owner::Free);
    assert!(!router.grid.cell(GridCoord::new(6, 2, 0)).routed);
    assert_eq!(router.grid.owner(GridCoord::new(2, 2, 0)), Owner::Net(net));
}

#[test]
fn net_on_the_die_edge_routes() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 0.0, 0.0, 0);
    add_pin(&mut db, "p2", "n1", 4.0, 0.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();
    let segments = &router.db.nets[net.index()].routes[0].segments;
    assert_eq!(wire_length(segments), 4);
}

#[test]
fn ignored_nets_are_skipped() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 2.0, 0);

    let config = Config::from_toml("[router]\nignore = [\"n1\"]\n").unwrap();
    let mut router = Router::new(db, config).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();
    assert!(router.db.nets[net.index()].routes.is_empty());
}

#[test]
fn three_pin_net_builds_a_connected_tree() {
    let mut db = make_db(12.0, &[LayerDirection::Horizontal, LayerDirection::Vertical]);
    add_pin(&mut db, "p1", "n1", 2.0, 2.0, 0);
    add_pin(&mut db, "p2", "n1", 10.0, 2.0, 0);
    add_pin(&mut db, "p3", "n1", 6.0, 9.0, 0);

    let mut router = Router::new(db, Config::default()).unwrap();
    assert_eq!(router.route(), 0);
    let net = router.db.find_net("n1").unwrap();
    assert_eq!(router.db.nets[net.index()].routes.len(), 2);
    assert!(check::run(&router.db, router.config.router.max_stack).is_ok());
}
