use crate::db::core::{NetClass, NetData, RouterDB, SegKind, Segment};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

type CellKey = (i32, i32, u8);

fn segment_cells(seg: &Segment) -> Vec<CellKey> {
    let mut cells = Vec::new();
    match seg.kind {
        SegKind::Via => {
            cells.push((seg.x1, seg.y1, seg.layer));
            cells.push((seg.x1, seg.y1, seg.layer + 1));
        }
        SegKind::Wire => {
            let dx = (seg.x2 - seg.x1).signum();
            let dy = (seg.y2 - seg.y1).signum();
            let mut x = seg.x1;
            let mut y = seg.y1;
            loop {
                cells.push((x, y, seg.layer));
                if x == seg.x2 && y == seg.y2 {
                    break;
                }
                x += dx;
                y += dy;
            }
        }
    }
    cells
}

/// Post-route design verification: no two nets share a grid cell, no via
/// column exceeds the stack limit, and every routed net is a connected
/// tree touching all of its nodes.
pub fn run(db: &RouterDB, max_stack: u8) -> Result<(), String> {
    log::info!("starting design verification");

    let (shorts, opens) = rayon::join(|| check_shorts(db), || check_opens(db));
    let stacks = check_stacks(db, max_stack);

    let mut msgs = Vec::new();
    match shorts {
        Ok(()) => log::info!("PASS: no shorts between routed nets"),
        Err(e) => {
            log::error!("FAIL: {}", e);
            msgs.push(e);
        }
    }
    match opens {
        Ok(()) => log::info!("PASS: all routed nets are connected"),
        Err(e) => {
            log::error!("FAIL: {}", e);
            msgs.push(e);
        }
    }
    match stacks {
        Ok(()) => log::info!("PASS: no stacked-via violations"),
        Err(e) => {
            log::error!("FAIL: {}", e);
            msgs.push(e);
        }
    }

    if msgs.is_empty() {
        Ok(())
    } else {
        Err(msgs.join("; "))
    }
}

fn net_cells(net: &NetData) -> Vec<CellKey> {
    net.routes
        .iter()
        .flat_map(|r| r.segments.iter())
        .flat_map(|s| segment_cells(s))
        .collect()
}

fn check_shorts(db: &RouterDB) -> Result<(), String> {
    let per_net: Vec<(usize, Vec<CellKey>)> = db
        .nets
        .par_iter()
        .enumerate()
        .map(|(i, net)| (i, net_cells(net)))
        .collect();

    let mut seen: HashMap<CellKey, usize> = HashMap::new();
    for (i, cells) in per_net {
        for cell in cells {
            if let Some(&j) = seen.get(&cell) {
                if j != i {
                    return Err(format!(
                        "nets '{}' and '{}' share grid cell ({}, {}, {})",
                        db.nets[j].name, db.nets[i].name, cell.0, cell.1, cell.2
                    ));
                }
            } else {
                seen.insert(cell, i);
            }
        }
    }
    Ok(())
}

fn check_opens(db: &RouterDB) -> Result<(), String> {
    let failures: Vec<String> = db
        .nets
        .par_iter()
        .filter_map(|net| check_net_connected(db, net).err())
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

fn check_net_connected(db: &RouterDB, net: &NetData) -> Result<(), String> {
    if net.routes.is_empty() {
        return Ok(());
    }
    let cells: HashSet<CellKey> = net_cells(net).into_iter().collect();

    // Every node must put at least one tap on the wiring. Rails connect
    // through their pre-routed geometry instead of node-to-node wiring.
    for &node_id in &net.nodes {
        let node = &db.nodes[node_id.index()];
        if node.unreachable {
            continue;
        }
        let touched = node
            .taps
            .iter()
            .chain(node.extend.iter())
            .any(|tap| cells.contains(&(tap.loc.x, tap.loc.y, tap.loc.layer)));
        if !touched && net.class == NetClass::Signal {
            return Err(format!(
                "net '{}': node '{}' is not touched by any segment",
                net.name, node.port_name
            ));
        }
    }

    if net.class != NetClass::Signal {
        return Ok(());
    }

    // The committed segments must form one connected component.
    let segs: Vec<Vec<CellKey>> = net
        .routes
        .iter()
        .flat_map(|r| r.segments.iter())
        .map(segment_cells)
        .collect();
    if segs.len() <= 1 {
        return Ok(());
    }
    let mut parent: Vec<usize> = (0..segs.len()).collect();
    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        if parent[i] != i {
            let root = find(parent, parent[i]);
            parent[i] = root;
        }
        parent[i]
    }
    let mut first_seen: HashMap<CellKey, usize> = HashMap::new();
    for (i, cells) in segs.iter().enumerate() {
        for &cell in cells {
            match first_seen.get(&cell) {
                Some(&j) => {
                    let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                    parent[ri] = rj;
                }
                None => {
                    first_seen.insert(cell, i);
                }
            }
        }
    }
    let root = find(&mut parent, 0);
    for i in 1..segs.len() {
        if find(&mut parent, i) != root {
            return Err(format!("net '{}': routed segments are disconnected", net.name));
        }
    }
    Ok(())
}

fn check_stacks(db: &RouterDB, max_stack: u8) -> Result<(), String> {
    for net in &db.nets {
        let mut columns: HashMap<(i32, i32), Vec<u8>> = HashMap::new();
        for route in &net.routes {
            for seg in &route.segments {
                if seg.kind == SegKind::Via {
                    columns.entry((seg.x1, seg.y1)).or_default().push(seg.layer);
                }
            }
        }
        for ((x, y), mut layers) in columns {
            layers.sort_unstable();
            layers.dedup();
            let mut run = 1;
            for w in layers.windows(2) {
                if w[1] == w[0] + 1 {
                    run += 1;
                    if run > max_stack {
                        return Err(format!(
                            "net '{}': via stack of height {} at ({}, {}) exceeds {}",
                            net.name,
                            run,
                            x,
                            y,
                            max_stack
                        ));
                    }
                } else {
                    run = 1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::core::{NetClass, Route};

    fn db_with_net(segments: Vec<Segment>) -> RouterDB {
        let mut db = RouterDB::new();
        let id = db.add_net("n1", NetClass::Signal);
        db.nets[id.index()].routes.push(Route { segments });
        db
    }

    #[test]
    fn connected_segments_pass() {
        let db = db_with_net(vec![
            Segment::wire(0, 0, 0, 4, 0),
            Segment::via(0, 4, 0),
            Segment::wire(1, 4, 0, 4, 5),
        ]);
        assert!(check_opens(&db).is_ok());
    }

    #[test]
    fn disconnected_segments_fail() {
        let db = db_with_net(vec![
            Segment::wire(0, 0, 0, 2, 0),
            Segment::wire(0, 5, 5, 8, 5),
        ]);
        assert!(check_opens(&db).is_err());
    }

    #[test]
    fn shared_cell_is_a_short() {
        let mut db = db_with_net(vec![Segment::wire(0, 0, 2, 6, 2)]);
        let other = db.add_net("n2", NetClass::Signal);
        db.nets[other.index()].routes.push(Route {
            segments: vec![Segment::wire(0, 3, 2, 3, 2)],
        });
        assert!(check_shorts(&db).is_err());
    }

    #[test]
    fn tall_stack_is_reported() {
        let db = db_with_net(vec![
            Segment::via(0, 1, 1),
            Segment::via(1, 1, 1),
            Segment::via(2, 1, 1),
        ]);
        assert!(check_stacks(&db, 2).is_err());
        assert!(check_stacks(&db, 3).is_ok());
    }
}
