use crate::db::indices::*;
use crate::geom::coord::{Dir, GridCoord};
use crate::geom::point::Point;
use crate::geom::rect::Rect;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerDirection {
    Horizontal,
    Vertical,
}

/// Minimum spacing for a layer, possibly keyed on conductor width.
#[derive(Clone, Debug, Default)]
pub struct SpacingRule {
    pub base: f64,
    /// (width, spacing) steps, ascending by width.
    pub table: Vec<(f64, f64)>,
}

impl SpacingRule {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            table: Vec::new(),
        }
    }

    /// Spacing required next to a conductor of the given width.
    pub fn lookup(&self, width: f64) -> f64 {
        let mut spacing = self.base;
        for &(w, s) in &self.table {
            if width >= w {
                spacing = s;
            } else {
                break;
            }
        }
        spacing
    }
}

#[derive(Clone, Debug)]
pub struct LayerData {
    pub name: String,
    pub index: u8,
    pub direction: LayerDirection,
    pub pitch_x: f64,
    pub pitch_y: f64,
    pub width: f64,
    pub spacing: SpacingRule,
    pub offset: f64,
}

/// A rectangle tagged with the routing layer it sits on.
#[derive(Clone, Copy, Debug)]
pub struct LayerRect {
    pub layer: u8,
    pub rect: Rect,
}

/// A via definition joining `layer` and `layer + 1`.
#[derive(Clone, Debug)]
pub struct ViaDef {
    pub name: String,
    pub layer: u8,
    pub rects: Vec<LayerRect>,
}

impl ViaDef {
    /// Footprint on one of the joined layers, if declared.
    pub fn footprint(&self, layer: u8) -> Option<Rect> {
        self.rects.iter().find(|lr| lr.layer == layer).map(|lr| lr.rect)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
    Tristate,
    Bidirectional,
    Feedthrough,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortUse {
    Signal,
    Clock,
    Power,
    Ground,
}

#[derive(Clone, Debug)]
pub struct PortDef {
    pub name: String,
    pub direction: PortDirection,
    pub use_class: PortUse,
    pub rects: Vec<LayerRect>,
}

#[derive(Clone, Debug)]
pub struct MacroDef {
    pub name: String,
    pub width: f64,
    pub height: f64,
    pub obs: Vec<LayerRect>,
    pub ports: Vec<PortDef>,
}

impl MacroDef {
    pub fn port(&self, name: &str) -> Option<&PortDef> {
        self.ports.iter().find(|p| p.name == name)
    }
}

/// Placement orientation. Only the four non-rotated variants are
/// representable; the 90-degree DEF orientations are rejected at parse time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Orient {
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Orient {
    pub const NORTH: Orient = Orient {
        flip_x: false,
        flip_y: false,
    };

    /// Apply the orientation to a rectangle given in macro-local
    /// coordinates, then translate to the placement origin.
    pub fn place(&self, r: Rect, size: (f64, f64), origin: Point<f64>) -> Rect {
        let (w, h) = size;
        let (x1, x2) = if self.flip_x {
            (w - r.max.x, w - r.min.x)
        } else {
            (r.min.x, r.max.x)
        };
        let (y1, y2) = if self.flip_y {
            (h - r.max.y, h - r.min.y)
        } else {
            (r.min.y, r.max.y)
        };
        Rect::from_corners(x1, y1, x2, y2).shifted(origin)
    }
}

/// A placed instance, or a pseudo-gate wrapping one top-level I/O pin.
#[derive(Clone, Debug)]
pub struct GateData {
    pub name: String,
    pub macro_id: Option<MacroId>,
    /// Present instead of `macro_id` for top-level pins.
    pub io_port: Option<PortDef>,
    pub origin: Point<f64>,
    pub orient: Orient,
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetClass {
    Signal,
    Power,
    Ground,
}

/// A pin tap resolved onto the routing grid.
#[derive(Clone, Copy, Debug)]
pub struct Tap {
    pub loc: GridCoord,
    /// Physical centre of the pin geometry this tap reaches.
    pub physical: Point<f64>,
    /// Sub-grid shift required to land on the pin: direction of the shift
    /// and the signed distance along that axis (positive = east/north).
    pub stub: Option<(Dir, f64)>,
}

#[derive(Clone, Debug)]
pub struct NodeData {
    pub net: NetId,
    pub gate: GateId,
    pub port_name: String,
    /// Grid cells whose centre lies inside the pin geometry.
    pub taps: Vec<Tap>,
    /// Grid cells within the keep-out halo but outside the geometry.
    pub extend: Vec<Tap>,
    pub unreachable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegKind {
    Wire,
    Via,
}

/// One committed route piece: a collinear wire on `layer`, or a via joining
/// `layer` and `layer + 1` (then x1 == x2, y1 == y2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegKind,
    pub layer: u8,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub offset_start: bool,
    pub offset_end: bool,
}

impl Segment {
    pub fn wire(layer: u8, x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            kind: SegKind::Wire,
            layer,
            x1,
            y1,
            x2,
            y2,
            offset_start: false,
            offset_end: false,
        }
    }

    pub fn via(layer: u8, x: i32, y: i32) -> Self {
        Self {
            kind: SegKind::Via,
            layer,
            x1: x,
            y1: y,
            x2: x,
            y2: y,
            offset_start: false,
            offset_end: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Route {
    pub segments: Vec<Segment>,
}

/// Pre-routed physical wiring read from the layout input; painted into the
/// grid before routing and re-emitted verbatim on output.
#[derive(Clone, Copy, Debug)]
pub struct PreWire {
    pub layer: u8,
    pub a: Point<f64>,
    pub b: Point<f64>,
    pub width: f64,
}

#[derive(Clone, Debug)]
pub struct NetData {
    pub name: String,
    pub class: NetClass,
    pub nodes: Vec<NodeId>,
    /// Grid-coordinate bounding box over all taps: (x1, y1, x2, y2).
    pub bbox: Option<(i32, i32, i32, i32)>,
    pub routes: Vec<Route>,
    pub prewires: Vec<PreWire>,
    /// Nets rerouted on this net's behalf this pass; they must not be
    /// disturbed when this net routes again.
    pub noripup: BTreeSet<NetId>,
    pub ignored: bool,
    pub critical: bool,
    /// Consecutive routing failures; drives the adaptive mask margin.
    pub fail_count: u32,
}

impl NetData {
    pub fn fanout(&self) -> usize {
        self.nodes.len()
    }

    pub fn half_perimeter(&self) -> i32 {
        match self.bbox {
            Some((x1, y1, x2, y2)) => (x2 - x1) + (y2 - y1),
            None => 0,
        }
    }

    pub fn grow_bbox(&mut self, x: i32, y: i32) {
        self.bbox = Some(match self.bbox {
            None => (x, y, x, y),
            Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
        });
    }
}

#[derive(Clone, Debug, Default)]
pub struct TrackDef {
    pub layer: String,
    /// "X" for vertical tracks (stepping in x), "Y" for horizontal.
    pub axis: String,
    pub start: f64,
    pub step: f64,
    pub count: u32,
}

/// The full design: library plus placed netlist. Built by the LEF/DEF
/// readers, consumed and annotated by the router, emitted by the DEF writer.
pub struct RouterDB {
    pub layers: Vec<LayerData>,
    pub vias: Vec<ViaDef>,
    pub macros: Vec<MacroDef>,
    pub gates: Vec<GateData>,
    pub nets: Vec<NetData>,
    pub nodes: Vec<NodeData>,
    pub tracks: Vec<TrackDef>,
    pub blockages: Vec<LayerRect>,

    pub die_area: Rect,
    /// Layout database units per micron.
    pub units: f64,
    pub design_name: String,

    pub macro_name_map: HashMap<String, MacroId>,
    pub gate_name_map: HashMap<String, GateId>,
    pub net_name_map: HashMap<String, NetId>,
    pub layer_name_map: HashMap<String, u8>,
}

impl Default for RouterDB {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterDB {
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            vias: Vec::new(),
            macros: Vec::new(),
            gates: Vec::with_capacity(1000),
            nets: Vec::with_capacity(1000),
            nodes: Vec::with_capacity(4000),
            tracks: Vec::new(),
            blockages: Vec::new(),
            die_area: Rect::default(),
            units: 1000.0,
            design_name: String::new(),
            macro_name_map: HashMap::new(),
            gate_name_map: HashMap::new(),
            net_name_map: HashMap::new(),
            layer_name_map: HashMap::new(),
        }
    }

    pub fn num_nets(&self) -> usize {
        self.nets.len()
    }

    pub fn add_layer(&mut self, mut layer: LayerData) -> u8 {
        let idx = self.layers.len() as u8;
        layer.index = idx;
        self.layer_name_map.insert(layer.name.clone(), idx);
        self.layers.push(layer);
        idx
    }

    pub fn find_layer(&self, name: &str) -> Option<u8> {
        self.layer_name_map.get(name).copied()
    }

    pub fn add_macro(&mut self, mac: MacroDef) -> MacroId {
        let id = MacroId::new(self.macros.len());
        self.macro_name_map.insert(mac.name.clone(), id);
        self.macros.push(mac);
        id
    }

    pub fn add_gate(&mut self, gate: GateData) -> GateId {
        let id = GateId::new(self.gates.len());
        self.gate_name_map.insert(gate.name.clone(), id);
        self.gates.push(gate);
        id
    }

    pub fn add_net(&mut self, name: &str, class: NetClass) -> NetId {
        if let Some(&id) = self.net_name_map.get(name) {
            return id;
        }
        let id = NetId::new(self.nets.len());
        self.nets.push(NetData {
            name: name.to_string(),
            class,
            nodes: Vec::new(),
            bbox: None,
            routes: Vec::new(),
            prewires: Vec::new(),
            noripup: BTreeSet::new(),
            ignored: false,
            critical: false,
            fail_count: 0,
        });
        self.net_name_map.insert(name.to_string(), id);
        id
    }

    pub fn add_node(&mut self, net: NetId, gate: GateId, port_name: &str) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        self.nodes.push(NodeData {
            net,
            gate,
            port_name: port_name.to_string(),
            taps: Vec::new(),
            extend: Vec::new(),
            unreachable: false,
        });
        self.nets[net.index()].nodes.push(id);
        self.gates[gate.index()].nodes.push(id);
        id
    }

    pub fn find_net(&self, name: &str) -> Option<NetId> {
        self.net_name_map.get(name).copied()
    }

    /// Via definition joining `layer` and `layer + 1` whose footprint is
    /// widest along x (or y). Non-square vias come in two orientations;
    /// square ones make the two answers coincide.
    pub fn via_variant(&self, layer: u8, prefer_x: bool) -> Option<&ViaDef> {
        let mut best: Option<(&ViaDef, f64)> = None;
        for via in self.vias.iter().filter(|v| v.layer == layer) {
            let fp = match via.footprint(layer) {
                Some(r) => r,
                None => continue,
            };
            let score = if prefer_x {
                fp.width() - fp.height()
            } else {
                fp.height() - fp.width()
            };
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((via, score)),
            }
        }
        best.map(|(v, _)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spacing_table_lookup() {
        let mut rule = SpacingRule::new(0.2);
        rule.table = vec![(0.5, 0.3), (1.0, 0.5)];
        assert_eq!(rule.lookup(0.1), 0.2);
        assert_eq!(rule.lookup(0.5), 0.3);
        assert_eq!(rule.lookup(0.7), 0.3);
        assert_eq!(rule.lookup(2.0), 0.5);
    }

    #[test]
    fn orient_mirrors_rect_about_macro_size() {
        let r = Rect::from_corners(1.0, 1.0, 2.0, 3.0);
        let flipped = Orient {
            flip_x: true,
            flip_y: false,
        }
        .place(r, (10.0, 10.0), Point::new(100.0, 0.0));
        assert_eq!(flipped.min.x, 108.0);
        assert_eq!(flipped.max.x, 109.0);
        assert_eq!(flipped.min.y, 1.0);
    }

    #[test]
    fn net_bbox_grows_monotonically() {
        let mut db = RouterDB::new();
        let n = db.add_net("a", NetClass::Signal);
        db.nets[n.index()].grow_bbox(5, 5);
        db.nets[n.index()].grow_bbox(2, 9);
        assert_eq!(db.nets[n.index()].bbox, Some((2, 5, 5, 9)));
        assert_eq!(db.nets[n.index()].half_perimeter(), 7);
    }

    #[test]
    fn add_net_is_idempotent_by_name() {
        let mut db = RouterDB::new();
        let a = db.add_net("clk", NetClass::Signal);
        let b = db.add_net("clk", NetClass::Signal);
        assert_eq!(a, b);
        assert_eq!(db.num_nets(), 1);
    }
}
