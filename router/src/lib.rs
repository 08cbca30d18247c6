pub mod commit;
pub mod frontier;
pub mod grid;
pub mod maze;
pub mod node;
pub mod schedule;

use crate::frontier::SearchGrid;
use crate::grid::{Owner, RouteGrid};
use gridroute_common::db::core::{NetClass, RouterDB};
use gridroute_common::db::defout::GridFrame;
use gridroute_common::db::indices::NetId;
use gridroute_common::util::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("design has no routing layers or tracks")]
    EmptyGrid,
    #[error("no such net '{0}'")]
    UnknownNet(String),
    #[error("net '{0}': no path found")]
    NoPath(String),
    #[error("net '{net}': no routable tap")]
    Unreachable { net: String },
    #[error("net '{net}': failed to remove stacked via at grid point {x} {y}")]
    StackRelief { net: String, x: i32, y: i32 },
}

/// The grid cell owner a net's own wiring carries.
pub(crate) fn net_owner(db: &RouterDB, net: NetId) -> Owner {
    match db.nets[net.index()].class {
        NetClass::Power => Owner::Power,
        NetClass::Ground => Owner::Ground,
        NetClass::Signal => Owner::Net(net),
    }
}

/// The router context: design, occupancy grid, reusable search state,
/// configuration, and the failed-net queue. The command surface (stage 1,
/// stage 2, rip-up, requeue) lives on this type.
pub struct Router {
    pub db: RouterDB,
    pub grid: RouteGrid,
    pub search: SearchGrid,
    pub config: Config,
    /// Nets awaiting (re)routing after a failure, front first.
    pub failed: std::collections::VecDeque<NetId>,
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Router {
    /// Build the routing grid for a loaded design and rasterise pins,
    /// obstructions and pre-routes onto it.
    pub fn new(mut db: RouterDB, config: Config) -> Result<Self, RouteError> {
        let mut grid = RouteGrid::build(&db)?;
        node::prepare(&mut db, &mut grid, &config);
        let search = SearchGrid::new(grid.len());
        Ok(Self {
            db,
            grid,
            search,
            config,
            failed: std::collections::VecDeque::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: None,
        })
    }

    /// Token checked between nets; setting it stops the scheduler cleanly
    /// with unfinished work left on the failed list.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub(crate) fn should_stop(&self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn frame(&self) -> GridFrame {
        self.grid.frame()
    }

    /// Route the whole design: stage 1 over every net, then stage 2
    /// rip-up-and-reroute passes until clean or the pass cap is reached.
    /// Returns the number of nets still failing.
    pub fn route(&mut self) -> usize {
        let failing = self.stage1(None);
        if failing == 0 {
            return 0;
        }
        self.stage2(None)
    }

    pub fn stage1(&mut self, net: Option<NetId>) -> usize {
        schedule::first_stage(self, net)
    }

    pub fn stage2(&mut self, net: Option<NetId>) -> usize {
        schedule::second_stage(self, net)
    }

    pub fn ripup(&mut self, net: NetId) {
        commit::ripup_net(&mut self.db, &mut self.grid, net, true);
    }

    pub fn ripup_all(&mut self) {
        for i in 0..self.db.num_nets() {
            commit::ripup_net(&mut self.db, &mut self.grid, NetId::new(i), true);
        }
    }

    /// Move every net onto the failed list: in priority order, or in the
    /// original netlist order.
    pub fn requeue_all(&mut self, ordered: bool) {
        self.failed.clear();
        if ordered {
            for net in schedule::net_order(&self.db) {
                self.failed.push_back(net);
            }
        } else {
            for i in 0..self.db.num_nets() {
                let net = NetId::new(i);
                if !self.db.nets[i].ignored {
                    self.failed.push_back(net);
                }
            }
        }
    }

    /// The most congested grid cells, for the post-route report.
    pub fn congestion(&self, limit: usize) -> Vec<(gridroute_common::geom::coord::GridCoord, u32)> {
        self.grid.congestion(limit)
    }
}
