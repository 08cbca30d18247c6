use crate::commit;
use crate::frontier::{build_mask, F_SOURCE, F_TARGET};
use crate::maze::{Maze, SeedOutcome, Stage};
use crate::{RouteError, Router};
use gridroute_common::db::core::NetClass;
use gridroute_common::db::indices::{NetId, NodeId};

/// Priority order: critical nets first, then hardest first by bounding-box
/// half-perimeter, fan-out breaking ties. Deterministic for equal keys.
pub fn net_order(db: &gridroute_common::db::core::RouterDB) -> Vec<NetId> {
    let mut order: Vec<NetId> = (0..db.num_nets())
        .map(NetId::new)
        .filter(|id| {
            let net = &db.nets[id.index()];
            !net.ignored && !net.nodes.is_empty()
        })
        .collect();
    order.sort_by(|a, b| {
        let na = &db.nets[a.index()];
        let nb = &db.nets[b.index()];
        nb.critical
            .cmp(&na.critical)
            .then(nb.half_perimeter().cmp(&na.half_perimeter()))
            .then(nb.fanout().cmp(&na.fanout()))
            .then(a.cmp(b))
    });
    order
}

/// Stage 1: route every net in priority order against the current
/// occupancy, with no collisions allowed. Failing nets queue up for
/// stage 2. Returns the failed-net count.
pub fn first_stage(router: &mut Router, only: Option<NetId>) -> usize {
    let order = match only {
        Some(net) => vec![net],
        None => net_order(&router.db),
    };
    log::info!("stage 1: routing {} nets", order.len());

    for (done, &net) in order.iter().enumerate() {
        if router.should_stop() {
            log::warn!("stage 1 interrupted; {} nets unrouted", order.len() - done);
            for &rest in &order[done..] {
                if router.db.nets[rest.index()].routes.is_empty() && !router.failed.contains(&rest) {
                    router.failed.push_back(rest);
                }
            }
            break;
        }
        if !router.db.nets[net.index()].routes.is_empty() {
            continue;
        }
        match route_net(router, net, Stage::First) {
            Ok(()) => {
                router.db.nets[net.index()].fail_count = 0;
                commit::release_node_costs(&router.db, &mut router.grid, net);
            }
            Err(e) => {
                log::warn!("stage 1: {}", e);
                router.db.nets[net.index()].fail_count += 1;
                if !router.failed.contains(&net) {
                    router.failed.push_back(net);
                }
            }
        }
    }
    log::info!("stage 1 done: {} nets failing", router.failed.len());
    router.failed.len()
}

/// Stage 2: work the failed list with collisions allowed, ripping up and
/// requeueing whatever the winning route runs through. Stops when the list
/// drains or the pass cap is reached. Returns the failed-net count.
pub fn second_stage(router: &mut Router, only: Option<NetId>) -> usize {
    if let Some(net) = only {
        router.failed.retain(|&n| n != net);
        return match route_net_ripup(router, net) {
            Ok(()) => {
                commit::release_node_costs(&router.db, &mut router.grid, net);
                0
            }
            Err(e) => {
                log::warn!("stage 2: {}", e);
                router.failed.push_back(net);
                1
            }
        };
    }

    let max_passes = router.config.router.passes;
    let mut pass = 0u32;
    let mut remaining_in_pass = router.failed.len();

    while let Some(net) = router.failed.pop_front() {
        if router.should_stop() {
            router.failed.push_front(net);
            log::warn!("stage 2 interrupted; {} nets unrouted", router.failed.len());
            break;
        }
        if remaining_in_pass == 0 {
            pass += 1;
            if pass >= max_passes {
                router.failed.push_front(net);
                log::error!(
                    "stage 2: pass limit ({}) reached with {} nets unroutable",
                    max_passes,
                    router.failed.len()
                );
                break;
            }
            remaining_in_pass = router.failed.len() + 1;
        }
        remaining_in_pass -= 1;

        match route_net_ripup(router, net) {
            Ok(()) => {
                router.db.nets[net.index()].fail_count = 0;
                commit::release_node_costs(&router.db, &mut router.grid, net);
            }
            Err(e) => {
                log::warn!("stage 2: {}", e);
                router.db.nets[net.index()].fail_count += 1;
                router.failed.push_back(net);
            }
        }
    }

    if router.failed.is_empty() {
        log::info!("stage 2 done: all nets routed");
    } else {
        let names: Vec<&str> = router
            .failed
            .iter()
            .map(|&n| router.db.nets[n.index()].name.as_str())
            .collect();
        log::error!("stage 2 done: still failing: {}", names.join(" "));
    }
    router.failed.len()
}

/// Rip up a failed net's partial progress and reroute it with collisions
/// allowed; colliding nets are ripped, requeued, and taught not to disturb
/// this net on their own reroute.
fn route_net_ripup(router: &mut Router, net: NetId) -> Result<(), RouteError> {
    commit::ripup_net(&mut router.db, &mut router.grid, net, true);
    route_net(router, net, Stage::Second)
}

/// Route one net completely: connect every node into one tree (or each
/// node to the rail for power and ground). Commits each connection as it
/// lands.
pub fn route_net(router: &mut Router, net: NetId, stage: Stage) -> Result<(), RouteError> {
    if router.db.nets[net.index()].ignored {
        return Ok(());
    }
    let is_rail = router.db.nets[net.index()].class != NetClass::Signal;
    let nodes: Vec<NodeId> = router.db.nets[net.index()]
        .nodes
        .iter()
        .copied()
        .filter(|&n| !router.db.nodes[n.index()].unreachable)
        .collect();

    if nodes.is_empty() {
        if router.db.nets[net.index()].nodes.is_empty() {
            return Ok(());
        }
        return Err(RouteError::Unreachable {
            net: router.db.nets[net.index()].name.clone(),
        });
    }
    if !is_rail && nodes.len() < 2 {
        return Ok(());
    }

    if is_rail {
        for &node in &nodes {
            route_rail_node(router, net, node, stage)?;
        }
        return Ok(());
    }

    let mut unconnected: Vec<NodeId> = nodes[1..].to_vec();
    let mut first = true;
    while !unconnected.is_empty() {
        let path = {
            let r = &mut *router;
            r.search.reset();
            let max_stack = r.config.router.max_stack;
            let mask = build_mask(r.config.router.mask, &r.db.nets[net.index()], &r.grid);
            let mut maze = Maze::new(
                &r.db,
                &r.grid,
                &mut r.search,
                &r.config.costs,
                mask,
                net,
                stage,
            );
            if first {
                if maze.seed_node(nodes[0], F_SOURCE) == SeedOutcome::Failed {
                    return Err(RouteError::Unreachable {
                        net: maze.db.nets[net.index()].name.clone(),
                    });
                }
                first = false;
            }
            maze.seed_route_sources();
            let mut any_target = false;
            for &t in &unconnected {
                if maze.seed_node(t, F_TARGET) != SeedOutcome::Failed {
                    any_target = true;
                }
            }
            if !any_target {
                return Err(RouteError::Unreachable {
                    net: maze.db.nets[net.index()].name.clone(),
                });
            }
            let target = maze.find_path()?;
            let mut path = maze.extract_path(target);
            maze.relieve_stacks(&mut path, max_stack)?;
            path
        };
        commit_connection(router, net, &path, stage);
        unconnected.retain(|&n| !node_touches_path(router, n, &path));
    }
    Ok(())
}

/// Connect one node of a power or ground net to the nearest point of the
/// rail.
fn route_rail_node(
    router: &mut Router,
    net: NetId,
    node: NodeId,
    stage: Stage,
) -> Result<(), RouteError> {
    let path = {
        let r = &mut *router;
        r.search.reset();
        let max_stack = r.config.router.max_stack;
        let mut maze = Maze::new(
            &r.db,
            &r.grid,
            &mut r.search,
            &r.config.costs,
            None,
            net,
            stage,
        );
        match maze.seed_node(node, F_SOURCE) {
            SeedOutcome::Failed => {
                return Err(RouteError::Unreachable {
                    net: maze.db.nets[net.index()].name.clone(),
                })
            }
            SeedOutcome::AlreadyConnected => return Ok(()),
            SeedOutcome::Seeded => {}
        }
        if maze.seed_rail_targets() == 0 {
            // Nothing left to reach: the rail is fully absorbed already.
            return Ok(());
        }
        let target = maze.find_path()?;
        let mut path = maze.extract_path(target);
        maze.relieve_stacks(&mut path, max_stack)?;
        path
    };
    commit_connection(router, net, &path, stage);
    Ok(())
}

/// Commit one connection. In stage 1 the grid is written immediately; in
/// stage 2 collisions are collected and ripped up first, and the losers
/// learn not to disturb this net when they reroute.
fn commit_connection(
    router: &mut Router,
    net: NetId,
    path: &[gridroute_common::geom::coord::GridCoord],
    stage: Stage,
) {
    let immediate = stage == Stage::First;
    let route = commit::commit_route(&router.db, &mut router.grid, net, path, immediate);
    router.db.nets[net.index()].routes.push(route);

    if !immediate {
        let colliding = commit::find_colliding(&router.db, &router.grid, net);
        for k in colliding {
            commit::ripup_net(&mut router.db, &mut router.grid, k, true);
            router.db.nets[k.index()].noripup.insert(net);
            if !router.failed.contains(&k) {
                router.failed.push_back(k);
            }
        }
        let idx = router.db.nets[net.index()].routes.len() - 1;
        let route = router.db.nets[net.index()].routes[idx].clone();
        commit::writeback_route(&router.db, &mut router.grid, net, &route);
    }
}

fn node_touches_path(
    router: &Router,
    node: NodeId,
    path: &[gridroute_common::geom::coord::GridCoord],
) -> bool {
    let node = &router.db.nodes[node.index()];
    node.taps
        .iter()
        .chain(node.extend.iter())
        .any(|tap| path.contains(&tap.loc))
}
