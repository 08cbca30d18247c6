use crate::frontier::{Mask, SearchGrid, F_CONFLICT, F_COST, F_PROCESSED, F_SOURCE, F_TARGET, MAX_COST};
use crate::grid::{Owner, RouteGrid};
use crate::RouteError;
use gridroute_common::db::core::{LayerDirection, NetClass, NodeData, RouterDB, SegKind};
use gridroute_common::db::indices::{NetId, NodeId};
use gridroute_common::geom::coord::{Dir, GridCoord};
use gridroute_common::util::config::CostConfig;

/// Routing stage. The second stage may relax through other nets' routes at
/// the conflict cost; the first may not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    First,
    Second,
}

/// How a node's taps were made routable while seeding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedOutcome {
    Seeded,
    /// A tap already carries the source flag: the node is connected.
    AlreadyConnected,
    Failed,
}

/// One net's wavefront expansion over the grid.
pub struct Maze<'a> {
    pub db: &'a RouterDB,
    pub grid: &'a RouteGrid,
    pub search: &'a mut SearchGrid,
    pub costs: &'a CostConfig,
    pub mask: Option<Mask>,
    pub net: NetId,
    pub stage: Stage,
    owner: Owner,
}

impl<'a> Maze<'a> {
    pub fn new(
        db: &'a RouterDB,
        grid: &'a RouteGrid,
        search: &'a mut SearchGrid,
        costs: &'a CostConfig,
        mask: Option<Mask>,
        net: NetId,
        stage: Stage,
    ) -> Self {
        let owner = match db.nets[net.index()].class {
            NetClass::Power => Owner::Power,
            NetClass::Ground => Owner::Ground,
            NetClass::Signal => Owner::Net(net),
        };
        Self {
            db,
            grid,
            search,
            costs,
            mask,
            net,
            stage,
            owner,
        }
    }

    /// Seed one node's taps as source (cost zero, queued) or target
    /// (marked, not queued). Escalates through the desperation ladder when
    /// nothing is routable: first over colliding routes, then over
    /// obstructions with the contact shifted onto the pin.
    pub fn seed_node(&mut self, node_id: NodeId, role: u8) -> SeedOutcome {
        let base = self.seed_node_at(node_id, role, 0);
        if base != SeedOutcome::Failed {
            return base;
        }
        if self.stage == Stage::Second {
            let collide = self.seed_node_at(node_id, role, 2);
            if collide != SeedOutcome::Failed {
                return collide;
            }
            return self.seed_node_at(node_id, role, 3);
        }
        // First stage: forcing is only safe when no other net's route is
        // responsible for the blockage.
        if !self.node_blocked_by_route(node_id) {
            return self.seed_node_at(node_id, role, 3);
        }
        SeedOutcome::Failed
    }

    fn node_blocked_by_route(&self, node_id: NodeId) -> bool {
        let node = &self.db.nodes[node_id.index()];
        node.taps
            .iter()
            .chain(node.extend.iter())
            .any(|tap| matches!(self.grid.owner(tap.loc), Owner::Net(k) if Owner::Net(k) != self.owner))
    }

    fn seed_node_at(&mut self, node_id: NodeId, role: u8, desperation: u8) -> SeedOutcome {
        let node = &self.db.nodes[node_id.index()];
        let mut found = false;
        let mut connected = false;

        for tap in &node.taps {
            match self.seed_cell(tap.loc, role, desperation, false) {
                SeedOutcome::AlreadyConnected => connected = true,
                SeedOutcome::Seeded => found = true,
                SeedOutcome::Failed => {}
            }
        }
        for tap in &node.extend {
            // Halo cells are usable only where they were reserved for this
            // node when the pin geometry was rasterised.
            if self.grid.node_reserved(tap.loc) != Some(node_id) && desperation < 3 {
                continue;
            }
            match self.seed_cell(tap.loc, role, desperation, true) {
                SeedOutcome::AlreadyConnected => connected = true,
                SeedOutcome::Seeded => found = true,
                SeedOutcome::Failed => {}
            }
        }

        if connected {
            SeedOutcome::AlreadyConnected
        } else if found {
            SeedOutcome::Seeded
        } else {
            SeedOutcome::Failed
        }
    }

    fn seed_cell(&mut self, c: GridCoord, role: u8, desperation: u8, extended: bool) -> SeedOutcome {
        if !self.grid.in_bounds(c) {
            return SeedOutcome::Failed;
        }
        let idx = self.grid.index(c);
        let flags = self.search.flags(idx);
        if flags & F_SOURCE != 0 {
            return SeedOutcome::AlreadyConnected;
        }
        if flags & role != 0 {
            return SeedOutcome::Failed;
        }

        let cell = self.grid.cell(c);
        let routable = if cell.owner == self.owner {
            true
        } else {
            match cell.owner {
                Owner::Free => (extended && desperation >= 2) || desperation >= 3,
                Owner::Obstructed => desperation >= 3,
                _ => desperation >= 2,
            }
        };
        if !routable {
            return SeedOutcome::Failed;
        }
        if cell.owner != self.owner && !matches!(cell.owner, Owner::Free) {
            self.search.set_flags(idx, F_CONFLICT);
        }

        if role == F_SOURCE {
            self.search.set_flags(idx, F_SOURCE | F_COST);
            self.search.set_cost(idx, 0);
            self.search.set_pred(idx, None);
            self.search.enqueue(idx, 0);
        } else {
            self.search.set_flags(idx, F_TARGET | F_COST);
            self.search.set_cost(idx, MAX_COST);
        }
        SeedOutcome::Seeded
    }

    /// Everything already committed for this net is a source by
    /// definition. Nodes touched by those routes are absorbed into the
    /// source set and lose any target marking.
    pub fn seed_route_sources(&mut self) {
        let mut touched: Vec<NodeId> = Vec::new();
        let net = &self.db.nets[self.net.index()];
        for route in &net.routes {
            for seg in &route.segments {
                for c in segment_cells(seg) {
                    if !self.grid.in_bounds(c) {
                        continue;
                    }
                    let idx = self.grid.index(c);
                    self.search.clear_flags(idx, F_TARGET);
                    self.search.set_flags(idx, F_SOURCE | F_COST);
                    self.search.set_cost(idx, 0);
                    self.search.set_pred(idx, None);
                    self.search.enqueue(idx, 0);
                    if let Some(n2) = self.grid.node_reserved(c) {
                        if self.db.nodes[n2.index()].net == self.net && !touched.contains(&n2) {
                            touched.push(n2);
                        }
                    }
                }
            }
        }
        for node_id in touched {
            self.clear_target_node(node_id);
            self.seed_node_at(node_id, F_SOURCE, 0);
        }
    }

    fn clear_target_node(&mut self, node_id: NodeId) {
        let node = &self.db.nodes[node_id.index()];
        for tap in node.taps.iter().chain(node.extend.iter()) {
            if self.grid.in_bounds(tap.loc) {
                let idx = self.grid.index(tap.loc);
                self.search.clear_flags(idx, F_TARGET);
            }
        }
    }

    /// For a power or ground net, every cell already owned by the rail is a
    /// target: touching the rail anywhere completes the route. Returns the
    /// number of cells marked.
    pub fn seed_rail_targets(&mut self) -> usize {
        let mut count = 0;
        for idx in 0..self.grid.len() {
            let c = self.grid.coord_of(idx);
            if self.grid.owner(c) != self.owner {
                continue;
            }
            let flags = self.search.flags(idx);
            if flags & F_SOURCE != 0 {
                continue;
            }
            self.search.set_flags(idx, F_TARGET | F_COST);
            count += 1;
        }
        count
    }

    /// Expand the frontier until a target cell pops. Returns the target
    /// reached, or `NoPath` when the frontier drains first.
    pub fn find_path(&mut self) -> Result<GridCoord, RouteError> {
        while let Some((idx, popped)) = self.search.pop() {
            let flags = self.search.flags(idx);
            if flags & F_PROCESSED != 0 || popped > self.search.cost(idx) {
                continue;
            }
            let c = self.grid.coord_of(idx);
            if flags & F_TARGET != 0 {
                return Ok(c);
            }
            self.search.set_flags(idx, F_PROCESSED);
            let cost = self.search.cost(idx);

            for dir in Dir::ALL {
                let n = dir.step(c);
                if !self.grid.in_bounds(n) {
                    continue;
                }
                if let Some(mask) = self.mask {
                    if !mask.contains(n) {
                        continue;
                    }
                }
                self.eval_pt(cost, n, dir);
            }
        }
        Err(RouteError::NoPath(
            self.db.nets[self.net.index()].name.clone(),
        ))
    }

    /// Score one step onto `n`; requeue it when the accumulated cost
    /// improves.
    fn eval_pt(&mut self, from_cost: u32, n: GridCoord, dir: Dir) {
        let idx = self.grid.index(n);
        let flags = self.search.flags(idx);
        if flags & F_SOURCE != 0 {
            return;
        }

        let mut conflict = flags & F_CONFLICT != 0;
        if flags & F_COST == 0 {
            // First touch: decide routability from the occupancy map.
            let cell = self.grid.cell(n);
            let routable = match cell.owner {
                Owner::Free => true,
                owner if owner == self.owner => true,
                Owner::Obstructed => false,
                Owner::Power | Owner::Ground => false,
                Owner::Net(k) => {
                    self.stage == Stage::Second
                        && self.grid.node_reserved(n).is_none()
                        && !self.db.nets[self.net.index()].noripup.contains(&k)
                }
            };
            if !routable {
                return;
            }
            if cell.owner != self.owner && !matches!(cell.owner, Owner::Free) {
                self.search.set_flags(idx, F_CONFLICT);
                conflict = true;
            }
        }

        let mut step = self.step_cost(n, dir);
        if conflict {
            step = step.saturating_add(self.costs.conflict);
        }

        let new_cost = from_cost.saturating_add(step);
        if new_cost < self.search.cost(idx) {
            self.search.set_flags(idx, F_COST);
            self.search.clear_flags(idx, F_PROCESSED);
            self.search.set_cost(idx, new_cost);
            self.search.set_pred(idx, Some(dir.opposite()));
            self.search.enqueue(idx, new_cost);
        }
    }

    /// Cost of a single step onto `n` along `dir`, excluding conflict
    /// surcharges.
    fn step_cost(&self, n: GridCoord, dir: Dir) -> u32 {
        let mut cost = match dir {
            Dir::Up | Dir::Down => self.costs.via,
            Dir::East | Dir::West => match self.layer_dir(n.layer) {
                LayerDirection::Horizontal => self.costs.segment,
                LayerDirection::Vertical => self.costs.jog,
            },
            Dir::North | Dir::South => match self.layer_dir(n.layer) {
                LayerDirection::Horizontal => self.costs.jog,
                LayerDirection::Vertical => self.costs.segment,
            },
        };

        // Crossing over (or under) another node's tap risks boxing it in;
        // charge by how scarce its access points are.
        if n.layer > 0 {
            cost = cost.saturating_add(self.crossover_cost(GridCoord::new(n.x, n.y, n.layer - 1)));
        }
        if n.layer + 1 < self.grid.num_layers() {
            cost = cost.saturating_add(self.crossover_cost(GridCoord::new(n.x, n.y, n.layer + 1)));
        }
        cost
    }

    fn crossover_cost(&self, c: GridCoord) -> u32 {
        let node_id = match self.grid.node_at(c) {
            Some(id) => id,
            None => return 0,
        };
        let idx = self.grid.index(c);
        let flags = self.search.flags(idx);
        if flags & (F_SOURCE | F_TARGET) != 0 {
            return 0;
        }
        let node: &NodeData = &self.db.nodes[node_id.index()];
        if node.taps.len() == 1 {
            self.costs.block
        } else if node.taps.is_empty() {
            match node.extend.len() {
                0 => 0,
                1 => 10 * self.costs.block,
                _ => self.costs.block,
            }
        } else {
            self.costs.crossover
        }
    }

    fn layer_dir(&self, layer: u8) -> LayerDirection {
        self.db.layers[layer as usize].direction
    }

    /// Walk predecessors from the popped target back to a source cell.
    /// The result is ordered target first, matching segment generation.
    pub fn extract_path(&self, target: GridCoord) -> Vec<GridCoord> {
        let mut path = vec![target];
        let mut cur = target;
        while let Some(dir) = self.search.pred(self.grid.index(cur)) {
            cur = dir.step(cur);
            path.push(cur);
        }
        path
    }

    /// Enforce the stacked-via limit on an extracted path. Columns taller
    /// than `max_stack` are split by detouring one contact onto a
    /// neighbouring cell that the wavefront also reached. Prefers moving
    /// the contact nearer the target; falls back to the one nearer the
    /// source; in the second stage a failed move may collide with another
    /// net rather than fail the route.
    pub fn relieve_stacks(&mut self, path: &mut Vec<GridCoord>, max_stack: u8) -> Result<(), RouteError> {
        if max_stack as usize >= self.grid.num_layers() as usize - 1 {
            return Ok(());
        }
        let mut collide = false;
        let mut rounds = 0usize;
        loop {
            match self.find_tall_stack(path, max_stack) {
                None => return Ok(()),
                Some((start, height)) => {
                    rounds += 1;
                    if rounds > path.len() + self.grid.num_layers() as usize * 4 {
                        return Err(self.stack_error(path[start]));
                    }
                    if self.split_stack(path, start, height, collide) {
                        continue;
                    }
                    match self.stage {
                        Stage::First => return Err(self.stack_error(path[start])),
                        Stage::Second => {
                            if collide {
                                return Err(self.stack_error(path[start]));
                            }
                            collide = true;
                        }
                    }
                }
            }
        }
    }

    fn stack_error(&self, c: GridCoord) -> RouteError {
        RouteError::StackRelief {
            net: self.db.nets[self.net.index()].name.clone(),
            x: c.x,
            y: c.y,
        }
    }

    /// First run of consecutive layer changes at one (x, y) taller than the
    /// limit: returns (index of run start, height in vias).
    fn find_tall_stack(&self, path: &[GridCoord], max_stack: u8) -> Option<(usize, usize)> {
        let mut i = 0;
        while i + 1 < path.len() {
            if path[i].layer != path[i + 1].layer && path[i].x == path[i + 1].x && path[i].y == path[i + 1].y
            {
                let start = i;
                let mut height = 0;
                while i + 1 < path.len()
                    && path[i].layer != path[i + 1].layer
                    && path[i].x == path[start].x
                    && path[i + 1].x == path[start].x
                    && path[i].y == path[start].y
                    && path[i + 1].y == path[start].y
                {
                    height += 1;
                    i += 1;
                }
                if height > max_stack as usize {
                    return Some((start, height));
                }
            } else {
                i += 1;
            }
        }
        None
    }

    /// Try to bend one via of the column sideways. Move candidates are
    /// scanned from the target end of the run toward the source end, each
    /// over the four lateral neighbours in compass order.
    fn split_stack(&mut self, path: &mut Vec<GridCoord>, start: usize, height: usize, collide: bool) -> bool {
        for k in (start..start + height).rev() {
            let here = path[k];
            let next = path[k + 1];
            debug_assert_ne!(here.layer, next.layer);

            let mut best: Option<(GridCoord, u32)> = None;
            for dir in [Dir::East, Dir::West, Dir::North, Dir::South] {
                let q = dir.step(here);
                if !self.grid.in_bounds(q) {
                    continue;
                }
                let q2 = GridCoord::new(q.x, q.y, next.layer);
                if let Some(cost) = self.detour_cost(q, collide) {
                    if self.detour_cost(q2, collide).is_some() {
                        match best {
                            Some((_, c)) if c <= cost => {}
                            _ => best = Some((q, cost)),
                        }
                    }
                }
            }

            if let Some((q, _)) = best {
                let q2 = GridCoord::new(q.x, q.y, next.layer);
                path.splice(k + 1..k + 1, [q, q2]);
                // A detour landing on the following point's position makes
                // the intermediate step redundant.
                path.dedup();
                return true;
            }
        }
        false
    }

    /// A cell the detour may pass through: reached by this search (with a
    /// real predecessor), or, when colliding, a foreign route cell that is
    /// not a terminal.
    fn detour_cost(&self, c: GridCoord, collide: bool) -> Option<u32> {
        let idx = self.grid.index(c);
        let flags = self.search.flags(idx);
        if flags & F_COST != 0 && self.search.cost(idx) < MAX_COST {
            if flags & F_SOURCE != 0 || self.search.pred(idx).is_some() {
                return Some(self.search.cost(idx));
            }
        }
        if collide {
            if let Owner::Net(k) = self.grid.owner(c) {
                if self.grid.node_reserved(c).is_none()
                    && !self.db.nets[self.net.index()].noripup.contains(&k)
                {
                    return Some(self.costs.conflict);
                }
            }
        }
        None
    }
}

/// Every grid cell a committed segment covers; vias contribute the cell on
/// both joined layers.
pub fn segment_cells(seg: &gridroute_common::db::core::Segment) -> Vec<GridCoord> {
    let mut cells = Vec::new();
    match seg.kind {
        SegKind::Via => {
            cells.push(GridCoord::new(seg.x1, seg.y1, seg.layer));
            cells.push(GridCoord::new(seg.x1, seg.y1, seg.layer + 1));
        }
        SegKind::Wire => {
            let dx = (seg.x2 - seg.x1).signum();
            let dy = (seg.y2 - seg.y1).signum();
            let mut x = seg.x1;
            let mut y = seg.y1;
            loop {
                cells.push(GridCoord::new(x, y, seg.layer));
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
