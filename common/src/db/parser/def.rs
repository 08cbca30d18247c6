use crate::db::core::{
    GateData, LayerRect, NetClass, Orient, PortDef, PortDirection, PortUse, PreWire, RouterDB,
    TrackDef,
};
use crate::db::parser::ParseError;
use crate::geom::point::Point;
use crate::geom::rect::Rect;
use std::fs::File;
use std::io::{BufRead, BufReader};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Top,
    Components,
    Pins,
    Nets,
    SpecialNets,
    Blockages,
    Other,
}

/// Read a DEF layout file: die area, tracks, placed components, top-level
/// pins, blockages, and any pre-routed NETS/SPECIALNETS geometry.
pub fn parse(db: &mut RouterDB, filename: &str) -> Result<(), ParseError> {
    let file = File::open(filename).map_err(|e| ParseError::Io(e, filename.to_string()))?;
    let reader = BufReader::new(file);

    let mut section = Section::Top;
    let mut stmt: Vec<String> = Vec::new();
    let mut stmt_line = 0usize;
    let mut warned_nonmanhattan = false;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ParseError::Io(e, filename.to_string()))?;
        let lineno = lineno + 1;
        let text = match line.split('#').next() {
            Some(t) => t,
            None => continue,
        };
        for tok in text.split_whitespace() {
            if stmt.is_empty() {
                stmt_line = lineno;
            }
            let (body, terminated) = match tok.strip_suffix(';') {
                Some(b) => (b, true),
                None => (tok, tok == ";"),
            };
            if !body.is_empty() && body != ";" {
                stmt.push(body.to_string());
            }
            if terminated && !stmt.is_empty() {
                process(
                    db,
                    filename,
                    stmt_line,
                    &stmt,
                    &mut section,
                    &mut warned_nonmanhattan,
                )?;
                stmt.clear();
            }
        }
        // Section brackets are not semicolon-terminated.
        if !stmt.is_empty() {
            let keyword = stmt[0].as_str();
            let is_section = matches!(
                keyword,
                "COMPONENTS" | "PINS" | "NETS" | "SPECIALNETS" | "BLOCKAGES" | "VIAS" | "END"
            );
            if is_section {
                process(
                    db,
                    filename,
                    stmt_line,
                    &stmt,
                    &mut section,
                    &mut warned_nonmanhattan,
                )?;
                stmt.clear();
            }
        }
    }
    Ok(())
}

fn process(
    db: &mut RouterDB,
    file: &str,
    line: usize,
    stmt: &[String],
    section: &mut Section,
    warned_nonmanhattan: &mut bool,
) -> Result<(), ParseError> {
    match stmt[0].as_str() {
        "VERSION" | "DIVIDERCHAR" | "BUSBITCHARS" | "HISTORY" => {}
        "DESIGN" => {
            if let Some(name) = stmt.get(1) {
                db.design_name = name.clone();
            }
        }
        "UNITS" => {
            if let Some(pos) = stmt.iter().position(|t| t == "MICRONS") {
                if let Some(val) = stmt.get(pos + 1) {
                    db.units = val.parse::<f64>().map_err(|_| {
                        ParseError::malformed(file, line, "UNITS", format!("bad value '{}'", val))
                    })?;
                }
            }
        }
        "DIEAREA" => {
            let pts = collect_points(db, file, line, "DIEAREA", &stmt[1..], &mut Vec::new())?;
            if pts.len() < 2 {
                return Err(ParseError::malformed(file, line, "DIEAREA", "expected two corners"));
            }
            db.die_area = Rect::from_corners(pts[0].x, pts[0].y, pts[1].x, pts[1].y);
        }
        "TRACKS" => parse_tracks(db, file, line, stmt)?,
        "COMPONENTS" => *section = Section::Components,
        "PINS" => *section = Section::Pins,
        "NETS" => *section = Section::Nets,
        "SPECIALNETS" => *section = Section::SpecialNets,
        "BLOCKAGES" => *section = Section::Blockages,
        "VIAS" | "REGIONS" | "GCELLGRID" | "ROW" => *section = Section::Other,
        "END" => {
            if stmt.len() > 1 {
                *section = Section::Top;
            }
        }
        "-" => match *section {
            Section::Components => parse_component(db, file, line, stmt)?,
            Section::Pins => parse_pin(db, file, line, stmt)?,
            Section::Nets => parse_net(db, file, line, stmt, false, warned_nonmanhattan)?,
            Section::SpecialNets => parse_net(db, file, line, stmt, true, warned_nonmanhattan)?,
            Section::Blockages => parse_blockage(db, file, line, stmt)?,
            _ => {}
        },
        _ => {}
    }
    Ok(())
}

fn parse_tracks(db: &mut RouterDB, file: &str, line: usize, stmt: &[String]) -> Result<(), ParseError> {
    // TRACKS X <start> DO <count> STEP <step> LAYER <name> [name ...]
    if stmt.len() < 7 {
        return Err(ParseError::malformed(file, line, "TRACKS", "truncated statement"));
    }
    let axis = stmt[1].clone();
    let start: f64 = num(file, line, "TRACKS", &stmt[2])? / db.units;
    let mut count = 0u32;
    let mut step = 0.0f64;
    let mut layers = Vec::new();
    let mut i = 3;
    while i < stmt.len() {
        match stmt[i].as_str() {
            "DO" => {
                count = num(file, line, "TRACKS", &stmt[i + 1])? as u32;
                i += 2;
            }
            "STEP" => {
                step = num(file, line, "TRACKS", &stmt[i + 1])? / db.units;
                i += 2;
            }
            "LAYER" => {
                i += 1;
                while i < stmt.len() {
                    layers.push(stmt[i].clone());
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    for layer in layers {
        if db.find_layer(&layer).is_none() {
            return Err(ParseError::UnknownLayer {
                file: file.to_string(),
                line,
                name: layer,
            });
        }
        db.tracks.push(TrackDef {
            layer,
            axis: axis.clone(),
            start,
            step,
            count,
        });
    }
    Ok(())
}

fn parse_orient(file: &str, line: usize, tok: &str) -> Result<Orient, ParseError> {
    match tok {
        "N" => Ok(Orient::NORTH),
        "S" => Ok(Orient {
            flip_x: true,
            flip_y: true,
        }),
        "FN" => Ok(Orient {
            flip_x: true,
            flip_y: false,
        }),
        "FS" => Ok(Orient {
            flip_x: false,
            flip_y: true,
        }),
        "E" | "W" | "FE" | "FW" => Err(ParseError::RotatedOrientation {
            file: file.to_string(),
            line,
            orient: tok.to_string(),
        }),
        other => Err(ParseError::malformed(
            file,
            line,
            "orientation",
            format!("unknown orientation '{}'", other),
        )),
    }
}

fn parse_component(db: &mut RouterDB, file: &str, line: usize, stmt: &[String]) -> Result<(), ParseError> {
    // - <name> <macro> + PLACED ( x y ) <orient> ...
    if stmt.len() < 3 {
        return Err(ParseError::malformed(file, line, "COMPONENTS", "missing instance or macro name"));
    }
    let name = stmt[1].clone();
    let macro_name = stmt[2].clone();
    let macro_id = db.macro_name_map.get(&macro_name).copied().ok_or_else(|| {
        ParseError::UnknownMacro {
            file: file.to_string(),
            line,
            name: macro_name.clone(),
        }
    })?;

    let mut origin = Point::new(0.0, 0.0);
    let mut orient = Orient::NORTH;
    let mut i = 3;
    while i < stmt.len() {
        if (stmt[i] == "PLACED" || stmt[i] == "FIXED") && i + 5 < stmt.len() && stmt[i + 1] == "(" {
            origin = Point::new(
                num(file, line, "COMPONENTS", &stmt[i + 2])? / db.units,
                num(file, line, "COMPONENTS", &stmt[i + 3])? / db.units,
            );
            orient = parse_orient(file, line, &stmt[i + 5])?;
            i += 6;
        } else {
            i += 1;
        }
    }

    db.add_gate(GateData {
        name,
        macro_id: Some(macro_id),
        io_port: None,
        origin,
        orient,
        nodes: Vec::new(),
    });
    Ok(())
}

fn parse_pin(db: &mut RouterDB, file: &str, line: usize, stmt: &[String]) -> Result<(), ParseError> {
    // - <name> + NET <net> + DIRECTION <dir> + USE <use>
    //   + LAYER <layer> ( x1 y1 ) ( x2 y2 ) + PLACED ( x y ) <orient>
    let name = stmt
        .get(1)
        .cloned()
        .ok_or_else(|| ParseError::malformed(file, line, "PINS", "missing pin name"))?;
    let mut net_name = None;
    let mut direction = PortDirection::Bidirectional;
    let mut use_class = PortUse::Signal;
    let mut rects: Vec<LayerRect> = Vec::new();
    let mut origin = Point::new(0.0, 0.0);
    let mut orient = Orient::NORTH;

    let mut i = 2;
    while i < stmt.len() {
        match stmt[i].as_str() {
            "NET" => {
                net_name = stmt.get(i + 1).cloned();
                i += 2;
            }
            "DIRECTION" => {
                direction = match stmt.get(i + 1).map(|s| s.as_str()) {
                    Some("INPUT") => PortDirection::Input,
                    Some("OUTPUT") => PortDirection::Output,
                    Some("TRISTATE") => PortDirection::Tristate,
                    Some("INOUT") => PortDirection::Bidirectional,
                    Some("FEEDTHRU") => PortDirection::Feedthrough,
                    other => {
                        return Err(ParseError::malformed(
                            file,
                            line,
                            "PINS DIRECTION",
                            format!("unknown direction {:?}", other),
                        ))
                    }
                };
                i += 2;
            }
            "USE" => {
                use_class = match stmt.get(i + 1).map(|s| s.as_str()) {
                    Some("SIGNAL") | Some("ANALOG") => PortUse::Signal,
                    Some("CLOCK") => PortUse::Clock,
                    Some("POWER") => PortUse::Power,
                    Some("GROUND") => PortUse::Ground,
                    other => {
                        return Err(ParseError::malformed(
                            file,
                            line,
                            "PINS USE",
                            format!("unknown use {:?}", other),
                        ))
                    }
                };
                i += 2;
            }
            "LAYER" => {
                let lname = stmt
                    .get(i + 1)
                    .ok_or_else(|| ParseError::malformed(file, line, "PINS LAYER", "missing name"))?;
                let layer = db.find_layer(lname).ok_or_else(|| ParseError::UnknownLayer {
                    file: file.to_string(),
                    line,
                    name: lname.clone(),
                })?;
                let mut rest = Vec::new();
                let pts = collect_points(db, file, line, "PINS", &stmt[i + 2..], &mut rest)?;
                if pts.len() >= 2 {
                    rects.push(LayerRect {
                        layer,
                        rect: Rect::from_corners(pts[0].x, pts[0].y, pts[1].x, pts[1].y),
                    });
                }
                i += 2 + rest[0];
            }
            "PLACED" | "FIXED" => {
                if i + 5 < stmt.len() && stmt[i + 1] == "(" {
                    origin = Point::new(
                        num(file, line, "PINS", &stmt[i + 2])? / db.units,
                        num(file, line, "PINS", &stmt[i + 3])? / db.units,
                    );
                    orient = parse_orient(file, line, &stmt[i + 5])?;
                    i += 6;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }

    let net_name = match net_name {
        Some(n) => n,
        None => {
            log::warn!("{}:{}: pin '{}' has no NET clause; ignored", file, line, name);
            return Ok(());
        }
    };

    let gate = db.add_gate(GateData {
        name: name.clone(),
        macro_id: None,
        io_port: Some(PortDef {
            name: name.clone(),
            direction,
            use_class,
            rects,
        }),
        origin,
        orient,
        nodes: Vec::new(),
    });
    let net = db.add_net(&net_name, NetClass::Signal);
    db.add_node(net, gate, &name);
    Ok(())
}

fn parse_blockage(db: &mut RouterDB, file: &str, line: usize, stmt: &[String]) -> Result<(), ParseError> {
    // - LAYER <name> RECT ( x1 y1 ) ( x2 y2 ) [RECT ...]
    if stmt.get(1).map(|s| s.as_str()) != Some("LAYER") {
        return Ok(()); // placement blockages do not affect routing
    }
    let lname = stmt
        .get(2)
        .ok_or_else(|| ParseError::malformed(file, line, "BLOCKAGES", "missing layer name"))?;
    let layer = db.find_layer(lname).ok_or_else(|| ParseError::UnknownLayer {
        file: file.to_string(),
        line,
        name: lname.clone(),
    })?;
    let mut i = 3;
    while i < stmt.len() {
        if stmt[i] == "RECT" {
            let mut rest = Vec::new();
            let pts = collect_points(db, file, line, "BLOCKAGES", &stmt[i + 1..], &mut rest)?;
            if pts.len() >= 2 {
                db.blockages.push(LayerRect {
                    layer,
                    rect: Rect::from_corners(pts[0].x, pts[0].y, pts[1].x, pts[1].y),
                });
            }
            i += 1 + rest[0];
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn parse_net(
    db: &mut RouterDB,
    file: &str,
    line: usize,
    stmt: &[String],
    special: bool,
    warned_nonmanhattan: &mut bool,
) -> Result<(), ParseError> {
    let name = stmt
        .get(1)
        .cloned()
        .ok_or_else(|| ParseError::malformed(file, line, "NETS", "missing net name"))?;
    let net = db.add_net(&name, NetClass::Signal);

    let mut i = 2;
    while i < stmt.len() {
        match stmt[i].as_str() {
            "(" => {
                // ( <inst> <pin> ) or ( PIN <name> )
                let a = stmt.get(i + 1).map(|s| s.as_str());
                let b = stmt.get(i + 2).map(|s| s.as_str());
                match (a, b) {
                    (Some("PIN"), Some(_)) => {
                        // Already materialised from the PINS section.
                    }
                    (Some("*"), Some(_)) => {
                        // Wildcard connection (every instance); power rails
                        // are routed against the painted rail, not per pin.
                    }
                    (Some(inst), Some(pin)) => {
                        match db.gate_name_map.get(inst).copied() {
                            Some(gate) => {
                                let already = db.gates[gate.index()]
                                    .nodes
                                    .iter()
                                    .any(|&nid| db.nodes[nid.index()].port_name == pin);
                                if !already {
                                    db.add_node(net, gate, pin);
                                }
                            }
                            None => {
                                log::warn!(
                                    "{}:{}: net '{}' references unknown instance '{}'",
                                    file,
                                    line,
                                    name,
                                    inst
                                );
                            }
                        }
                    }
                    _ => {}
                }
                i += 4; // skip "( a b )"
            }
            "+" => {
                match stmt.get(i + 1).map(|s| s.as_str()) {
                    Some("USE") => {
                        match stmt.get(i + 2).map(|s| s.as_str()) {
                            Some("POWER") => db.nets[net.index()].class = NetClass::Power,
                            Some("GROUND") => db.nets[net.index()].class = NetClass::Ground,
                            _ => {}
                        }
                        i += 3;
                    }
                    Some("ROUTED") | Some("FIXED") | Some("COVER") => {
                        i = parse_routed(db, file, line, stmt, i + 2, net, special, warned_nonmanhattan)?;
                    }
                    _ => i += 2,
                }
            }
            _ => i += 1,
        }
    }
    Ok(())
}

/// Parse one ROUTED clause starting at `start` (the token after ROUTED).
/// Returns the index of the first token not consumed.
#[allow(clippy::too_many_arguments)]
fn parse_routed(
    db: &mut RouterDB,
    file: &str,
    line: usize,
    stmt: &[String],
    start: usize,
    net: crate::db::indices::NetId,
    special: bool,
    warned_nonmanhattan: &mut bool,
) -> Result<usize, ParseError> {
    let mut i = start;
    loop {
        // <layer> [width] ( x y ) [point ...] [vianame]
        let lname = match stmt.get(i) {
            Some(t) => t,
            None => return Ok(i),
        };
        let layer = db.find_layer(lname).ok_or_else(|| ParseError::UnknownLayer {
            file: file.to_string(),
            line,
            name: lname.clone(),
        })?;
        i += 1;

        let mut width = db.layers[layer as usize].width;
        if special {
            if let Some(tok) = stmt.get(i) {
                if let Ok(w) = tok.parse::<f64>() {
                    width = w / db.units;
                    i += 1;
                }
            }
        }

        let mut prev: Option<Point<f64>> = None;
        while i < stmt.len() && stmt[i] == "(" {
            let xt = stmt.get(i + 1).map(|s| s.as_str()).unwrap_or("");
            let yt = stmt.get(i + 2).map(|s| s.as_str()).unwrap_or("");
            let x = if xt == "*" {
                prev.map(|p| p.x).unwrap_or(0.0)
            } else {
                num(file, line, "ROUTED", xt)? / db.units
            };
            let y = if yt == "*" {
                prev.map(|p| p.y).unwrap_or(0.0)
            } else {
                num(file, line, "ROUTED", yt)? / db.units
            };
            let p = Point::new(x, y);
            if let Some(q) = prev {
                if (q.x - p.x).abs() > 1e-9 && (q.y - p.y).abs() > 1e-9 {
                    if !*warned_nonmanhattan {
                        log::warn!(
                            "{}:{}: non-manhattan pre-routed segment on net skipped",
                            file,
                            line
                        );
                        *warned_nonmanhattan = true;
                    }
                } else {
                    db.nets[net.index()].prewires.push(PreWire {
                        layer,
                        a: q,
                        b: p,
                        width,
                    });
                }
            }
            prev = Some(p);
            i += 4;
        }

        // Optional via name; a single-point run with a via still paints the
        // via cell through its (degenerate) prewire.
        if i < stmt.len() && stmt[i] != "NEW" && stmt[i] != "+" && stmt[i] != "(" {
            if let Some(p) = prev {
                db.nets[net.index()].prewires.push(PreWire {
                    layer,
                    a: p,
                    b: p,
                    width,
                });
            }
            i += 1;
        }

        match stmt.get(i).map(|s| s.as_str()) {
            Some("NEW") => i += 1,
            _ => return Ok(i),
        }
    }
}

/// Collect "( x y )" groups. `consumed` receives the number of tokens eaten
/// as its single element.
fn collect_points(
    db: &RouterDB,
    file: &str,
    line: usize,
    section: &str,
    toks: &[String],
    consumed: &mut Vec<usize>,
) -> Result<Vec<Point<f64>>, ParseError> {
    let mut pts = Vec::new();
    let mut i = 0;
    while i + 3 < toks.len() && toks[i] == "(" {
        let x = num(file, line, section, &toks[i + 1])? / db.units;
        let y = num(file, line, section, &toks[i + 2])? / db.units;
        pts.push(Point::new(x, y));
        i += 4;
    }
    consumed.push(i);
    Ok(pts)
}

fn num(file: &str, line: usize, section: &str, tok: &str) -> Result<f64, ParseError> {
    tok.parse::<f64>()
        .map_err(|_| ParseError::malformed(file, line, section, format!("bad number '{}'", tok)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::core::{LayerData, LayerDirection, MacroDef, SpacingRule};
    use std::io::Write;

    fn db_with_layers() -> RouterDB {
        let mut db = RouterDB::new();
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
        db.add_macro(MacroDef {
            name: "INVX1".to_string(),
            width: 2.0,
            height: 6.0,
            obs: Vec::new(),
            ports: Vec::new(),
        });
        db
    }

    const SIMPLE_DEF: &str = "\
VERSION 5.8 ;
DESIGN demo ;
UNITS DISTANCE MICRONS 1000 ;
DIEAREA ( 0 0 ) ( 20000 20000 ) ;
TRACKS X 500 DO 20 STEP 1000 LAYER metal2 ;
TRACKS Y 500 DO 20 STEP 1000 LAYER metal1 ;
COMPONENTS 2 ;
- u1 INVX1 + PLACED ( 1000 1000 ) N ;
- u2 INVX1 + PLACED ( 9000 1000 ) FS ;
END COMPONENTS
PINS 1 ;
- in0 + NET n1 + DIRECTION INPUT + USE SIGNAL
  + LAYER metal1 ( -200 -200 ) ( 200 200 ) + PLACED ( 0 10000 ) N ;
END PINS
SPECIALNETS 1 ;
- vdd ( * vdd )
  + ROUTED metal1 800 ( 0 19500 ) ( 20000 19500 )
  + USE POWER ;
END SPECIALNETS
NETS 1 ;
- n1 ( PIN in0 ) ( u1 A ) ( u2 A ) ;
END NETS
END DESIGN
";

    #[test]
    fn parses_layout_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SIMPLE_DEF.as_bytes()).unwrap();

        let mut db = db_with_layers();
        parse(&mut db, f.path().to_str().unwrap()).unwrap();

        assert_eq!(db.design_name, "demo");
        assert_eq!(db.die_area.width(), 20.0);
        assert_eq!(db.tracks.len(), 2);
        assert_eq!(db.tracks[0].step, 1.0);

        // Two instances plus one pseudo-gate for the pin.
        assert_eq!(db.gates.len(), 3);
        assert!(db.gates[1].orient.flip_y);

        let n1 = db.find_net("n1").unwrap();
        assert_eq!(db.nets[n1.index()].nodes.len(), 3);

        let vdd = db.find_net("vdd").unwrap();
        assert_eq!(db.nets[vdd.index()].class, NetClass::Power);
        assert_eq!(db.nets[vdd.index()].prewires.len(), 1);
        assert_eq!(db.nets[vdd.index()].prewires[0].width, 0.8);
    }

    #[test]
    fn rotated_component_is_rejected() {
        let bad = "\
COMPONENTS 1 ;
- u1 INVX1 + PLACED ( 0 0 ) E ;
END COMPONENTS
";
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bad.as_bytes()).unwrap();
        let mut db = db_with_layers();
        let err = parse(&mut db, f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ParseError::RotatedOrientation { .. }));
    }
}
