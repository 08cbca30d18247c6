use crate::db::core::{
    LayerData, LayerDirection, LayerRect, MacroDef, PortDef, PortDirection, PortUse, RouterDB,
    SpacingRule, ViaDef,
};
use crate::db::parser::ParseError;
use crate::geom::rect::Rect;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// Read a LEF library file: routing layers, via definitions, and cell
/// macros with their pin geometry and obstructions.
pub fn parse(db: &mut RouterDB, filename: &str) -> Result<(), ParseError> {
    let file = File::open(filename).map_err(|e| ParseError::Io(e, filename.to_string()))?;
    let reader = BufReader::new(file);

    let mut state = LefState::default();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| ParseError::Io(e, filename.to_string()))?;
        let lineno = lineno + 1;
        let text = match line.split('#').next() {
            Some(t) => t,
            None => continue,
        };
        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }
        state.statement(db, filename, lineno, &parts)?;
    }

    if db.layers.is_empty() {
        return Err(ParseError::malformed(
            filename,
            0,
            "LAYER",
            "no routing layers defined",
        ));
    }
    Ok(())
}

#[derive(Default)]
struct LefState {
    // LAYER section under construction
    layer_name: Option<String>,
    layer_is_routing: bool,
    layer_dir: Option<LayerDirection>,
    layer_pitch: (f64, f64),
    layer_width: f64,
    layer_spacing: SpacingRule,
    layer_offset: f64,

    // VIA section
    via: Option<ViaDef>,

    // MACRO section
    mac: Option<MacroDef>,
    pin: Option<PortDef>,
    in_obs: bool,
    /// Layer selected by the most recent LAYER line inside a PORT or OBS
    /// block; None when the layer is not a routing layer.
    rect_layer: Option<u8>,
}

impl LefState {
    fn statement(
        &mut self,
        db: &mut RouterDB,
        file: &str,
        lineno: usize,
        parts: &[&str],
    ) -> Result<(), ParseError> {
        match parts[0] {
            "LAYER" if self.mac.is_none() && self.via.is_none() && self.layer_name.is_none() => {
                self.layer_name = Some(parts[1].trim_end_matches(';').to_string());
                self.layer_is_routing = false;
                self.layer_dir = None;
                self.layer_pitch = (0.0, 0.0);
                self.layer_width = 0.0;
                self.layer_spacing = SpacingRule::default();
                self.layer_offset = 0.0;
            }
            "LAYER" if self.via.is_some() => {
                let name = parts[1].trim_end_matches(';');
                self.rect_layer = db.find_layer(name);
                if self.rect_layer.is_none() {
                    // Cut layers land here; their geometry is irrelevant to
                    // the routing grid.
                    log::debug!("{}:{}: via layer '{}' is not a routing layer", file, lineno, name);
                }
            }
            "LAYER" if self.pin.is_some() => {
                let name = parts[1].trim_end_matches(';');
                self.rect_layer = Some(db.find_layer(name).ok_or_else(|| {
                    ParseError::UnknownLayer {
                        file: file.to_string(),
                        line: lineno,
                        name: name.to_string(),
                    }
                })?);
            }
            "LAYER" if self.in_obs => {
                let name = parts[1].trim_end_matches(';');
                self.rect_layer = db.find_layer(name);
                if self.rect_layer.is_none() {
                    log::warn!(
                        "{}:{}: obstruction on unknown layer '{}' ignored",
                        file,
                        lineno,
                        name
                    );
                }
            }
            "TYPE" if self.layer_name.is_some() => {
                self.layer_is_routing = parts[1].trim_end_matches(';') == "ROUTING";
            }
            "DIRECTION" if self.layer_name.is_some() && self.pin.is_none() => {
                self.layer_dir = match parts[1].trim_end_matches(';') {
                    "HORIZONTAL" => Some(LayerDirection::Horizontal),
                    "VERTICAL" => Some(LayerDirection::Vertical),
                    _ => None,
                };
            }
            "DIRECTION" if self.pin.is_some() => {
                if let Some(pin) = self.pin.as_mut() {
                    pin.direction = match parts[1].trim_end_matches(';') {
                        "INPUT" => PortDirection::Input,
                        "OUTPUT" => PortDirection::Output,
                        "TRISTATE" => PortDirection::Tristate,
                        "INOUT" => PortDirection::Bidirectional,
                        "FEEDTHRU" => PortDirection::Feedthrough,
                        other => {
                            return Err(ParseError::malformed(
                                file,
                                lineno,
                                "PIN DIRECTION",
                                format!("unknown direction class '{}'", other),
                            ))
                        }
                    };
                }
            }
            "USE" if self.pin.is_some() => {
                if let Some(pin) = self.pin.as_mut() {
                    pin.use_class = match parts[1].trim_end_matches(';') {
                        "SIGNAL" | "ANALOG" => PortUse::Signal,
                        "CLOCK" => PortUse::Clock,
                        "POWER" => PortUse::Power,
                        "GROUND" => PortUse::Ground,
                        other => {
                            return Err(ParseError::malformed(
                                file,
                                lineno,
                                "PIN USE",
                                format!("unknown use class '{}'", other),
                            ))
                        }
                    };
                }
            }
            "PITCH" if self.layer_name.is_some() => {
                let px = parse_num(file, lineno, "PITCH", parts[1])?;
                let py = if parts.len() > 2 && parts[2] != ";" {
                    parse_num(file, lineno, "PITCH", parts[2])?
                } else {
                    px
                };
                self.layer_pitch = (px, py);
            }
            "WIDTH" if self.layer_name.is_some() => {
                self.layer_width = parse_num(file, lineno, "WIDTH", parts[1])?;
            }
            "OFFSET" if self.layer_name.is_some() => {
                self.layer_offset = parse_num(file, lineno, "OFFSET", parts[1])?;
            }
            "SPACING" if self.layer_name.is_some() => {
                let s = parse_num(file, lineno, "SPACING", parts[1])?;
                if parts.len() > 3 && parts[2] == "RANGE" {
                    // Width-indexed spacing: RANGE <wmin> <wmax>
                    let wmin = parse_num(file, lineno, "SPACING RANGE", parts[3])?;
                    self.layer_spacing.table.push((wmin, s));
                    self.layer_spacing
                        .table
                        .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                } else {
                    self.layer_spacing.base = s;
                }
            }
            "VIA" if self.mac.is_none() => {
                self.via = Some(ViaDef {
                    name: parts[1].trim_end_matches(';').to_string(),
                    layer: 0,
                    rects: Vec::new(),
                });
                self.rect_layer = None;
            }
            "MACRO" => {
                self.mac = Some(MacroDef {
                    name: parts[1].trim_end_matches(';').to_string(),
                    width: 0.0,
                    height: 0.0,
                    obs: Vec::new(),
                    ports: Vec::new(),
                });
            }
            "SIZE" if self.mac.is_some() => {
                // SIZE <w> BY <h> ;
                if parts.len() < 4 {
                    return Err(ParseError::malformed(file, lineno, "SIZE", "expected SIZE w BY h"));
                }
                let width = parse_num(file, lineno, "SIZE", parts[1])?;
                let height = parse_num(file, lineno, "SIZE", parts[3])?;
                if let Some(mac) = self.mac.as_mut() {
                    mac.width = width;
                    mac.height = height;
                }
            }
            "PIN" if self.mac.is_some() => {
                self.pin = Some(PortDef {
                    name: parts[1].trim_end_matches(';').to_string(),
                    direction: PortDirection::Input,
                    use_class: PortUse::Signal,
                    rects: Vec::new(),
                });
                self.rect_layer = None;
            }
            "OBS" if self.mac.is_some() => {
                self.in_obs = true;
                self.rect_layer = None;
            }
            "PORT" => {}
            "RECT" => {
                if parts.len() < 5 {
                    return Err(ParseError::malformed(file, lineno, "RECT", "expected 4 coordinates"));
                }
                let x1 = parse_num(file, lineno, "RECT", parts[1])?;
                let y1 = parse_num(file, lineno, "RECT", parts[2])?;
                let x2 = parse_num(file, lineno, "RECT", parts[3])?;
                let y2 = parse_num(file, lineno, "RECT", parts[4])?;
                let rect = Rect::from_corners(x1, y1, x2, y2);
                if let Some(via) = self.via.as_mut() {
                    if let Some(layer) = self.rect_layer {
                        via.rects.push(LayerRect { layer, rect });
                    }
                } else if let Some(pin) = self.pin.as_mut() {
                    if let Some(layer) = self.rect_layer {
                        pin.rects.push(LayerRect { layer, rect });
                    }
                } else if self.in_obs {
                    if let Some(layer) = self.rect_layer {
                        if let Some(mac) = self.mac.as_mut() {
                            mac.obs.push(LayerRect { layer, rect });
                        }
                    }
                }
            }
            "END" => self.end_section(db, file, lineno, parts)?,
            _ => {}
        }
        Ok(())
    }

    fn end_section(
        &mut self,
        db: &mut RouterDB,
        file: &str,
        lineno: usize,
        parts: &[&str],
    ) -> Result<(), ParseError> {
        let arg = parts.get(1).map(|s| s.trim_end_matches(';'));

        if self.in_obs && arg.is_none() {
            self.in_obs = false;
            return Ok(());
        }
        if let Some(pin) = self.pin.as_ref() {
            if arg == Some(pin.name.as_str()) {
                let pin = self.pin.take().unwrap();
                if let Some(mac) = self.mac.as_mut() {
                    mac.ports.push(pin);
                }
                return Ok(());
            }
            // END of a PORT block inside the pin
            if arg.is_none() {
                return Ok(());
            }
        }
        if let Some(via) = self.via.as_ref() {
            if arg == Some(via.name.as_str()) {
                let mut via = self.via.take().unwrap();
                // The via joins the lowest routing layer it touches and the
                // one above; anything else is reported once and dropped.
                match via.rects.iter().map(|lr| lr.layer).min() {
                    Some(bottom)
                        if via.rects.iter().any(|lr| lr.layer == bottom + 1) =>
                    {
                        via.layer = bottom;
                        db.vias.push(via);
                    }
                    _ => {
                        log::warn!(
                            "{}:{}: via '{}' does not join adjacent routing layers; ignored",
                            file,
                            lineno,
                            via.name
                        );
                    }
                }
                return Ok(());
            }
        }
        if let Some(name) = self.layer_name.as_ref() {
            if arg == Some(name.as_str()) {
                let name = self.layer_name.take().unwrap();
                if self.layer_is_routing {
                    let dir = self.layer_dir.unwrap_or_else(|| {
                        // Alternate by stack position when the library is silent.
                        if db.layers.len() % 2 == 0 {
                            LayerDirection::Horizontal
                        } else {
                            LayerDirection::Vertical
                        }
                    });
                    db.add_layer(LayerData {
                        name,
                        index: 0,
                        direction: dir,
                        pitch_x: self.layer_pitch.0,
                        pitch_y: self.layer_pitch.1,
                        width: self.layer_width,
                        spacing: std::mem::take(&mut self.layer_spacing),
                        offset: self.layer_offset,
                    });
                }
                return Ok(());
            }
        }
        if let Some(mac) = self.mac.as_ref() {
            if arg == Some(mac.name.as_str()) {
                let mac = self.mac.take().unwrap();
                db.add_macro(mac);
                return Ok(());
            }
        }
        Ok(())
    }
}

fn parse_num(file: &str, lineno: usize, section: &str, tok: &str) -> Result<f64, ParseError> {
    tok.trim_end_matches(';')
        .parse::<f64>()
        .map_err(|_| ParseError::malformed(file, lineno, section, format!("bad number '{}'", tok)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SIMPLE_LEF: &str = "\
LAYER metal1
  TYPE ROUTING ;
  DIRECTION HORIZONTAL ;
  PITCH 1.0 ;
  WIDTH 0.4 ;
  SPACING 0.4 ;
END metal1
LAYER via1
  TYPE CUT ;
END via1
LAYER metal2
  TYPE ROUTING ;
  DIRECTION VERTICAL ;
  PITCH 1.0 ;
  WIDTH 0.4 ;
  SPACING 0.4 ;
  SPACING 0.6 RANGE 1.0 10.0 ;
END metal2
VIA via12 DEFAULT
  LAYER metal1 ;
    RECT -0.3 -0.3 0.3 0.3 ;
  LAYER via1 ;
    RECT -0.2 -0.2 0.2 0.2 ;
  LAYER metal2 ;
    RECT -0.3 -0.3 0.3 0.3 ;
END via12
MACRO INVX1
  SIZE 2.0 BY 6.0 ;
  PIN A
    DIRECTION INPUT ;
    USE SIGNAL ;
    PORT
      LAYER metal1 ;
        RECT 0.3 2.8 0.7 3.2 ;
    END
  END A
  PIN Y
    DIRECTION OUTPUT ;
    USE SIGNAL ;
    PORT
      LAYER metal1 ;
        RECT 1.3 2.8 1.7 3.2 ;
    END
  END Y
  OBS
    LAYER metal1 ;
      RECT 0.0 0.0 2.0 0.4 ;
  END
END INVX1
END LIBRARY
";

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_layers_vias_and_macros() {
        let f = write_temp(SIMPLE_LEF);
        let mut db = RouterDB::new();
        parse(&mut db, f.path().to_str().unwrap()).unwrap();

        assert_eq!(db.layers.len(), 2);
        assert_eq!(db.layers[0].direction, LayerDirection::Horizontal);
        assert_eq!(db.layers[1].spacing.lookup(2.0), 0.6);
        assert_eq!(db.layers[1].spacing.lookup(0.4), 0.4);

        assert_eq!(db.vias.len(), 1);
        assert_eq!(db.vias[0].layer, 0);
        assert_eq!(db.vias[0].rects.len(), 2);

        let mac = &db.macros[0];
        assert_eq!(mac.name, "INVX1");
        assert_eq!(mac.width, 2.0);
        assert_eq!(mac.ports.len(), 2);
        assert_eq!(mac.ports[1].direction, PortDirection::Output);
        assert_eq!(mac.obs.len(), 1);
    }

    #[test]
    fn unknown_pin_layer_is_an_error() {
        let bad = "\
LAYER metal1
  TYPE ROUTING ;
  PITCH 1.0 ;
  WIDTH 0.4 ;
END metal1
MACRO BAD
  SIZE 1.0 BY 1.0 ;
  PIN A
    PORT
      LAYER metal9 ;
        RECT 0 0 1 1 ;
    END
  END A
END BAD
";
        let f = write_temp(bad);
        let mut db = RouterDB::new();
        let err = parse(&mut db, f.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ParseError::UnknownLayer { .. }));
    }
}
