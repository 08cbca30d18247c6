use serde::{Deserialize, Deserializer};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub costs: CostConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub obstruction: Vec<ObstructionConfig>,
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(text)?;
        config.normalize();
        Ok(config)
    }

    /// Compatibility coercions carried over from the original tool.
    fn normalize(&mut self) {
        if self.router.max_stack == 0 {
            log::warn!("max_stack = 0 disallows all vias; coerced to 1");
            self.router.max_stack = 1;
        }
    }
}

/// Integer step costs for the maze search.
#[derive(Debug, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_segment_cost")]
    pub segment: u32,
    #[serde(default = "default_via_cost")]
    pub via: u32,
    #[serde(default = "default_jog_cost")]
    pub jog: u32,
    #[serde(default = "default_crossover_cost")]
    pub crossover: u32,
    #[serde(default = "default_block_cost")]
    pub block: u32,
    #[serde(default = "default_conflict_cost")]
    pub conflict: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            segment: default_segment_cost(),
            via: default_via_cost(),
            jog: default_jog_cost(),
            crossover: default_crossover_cost(),
            block: default_block_cost(),
            conflict: default_conflict_cost(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViaPattern {
    None,
    Normal,
    Invert,
}

/// Spatial restriction of the maze search around a net's bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskMode {
    None,
    Auto,
    Bbox,
    Margin(u32),
}

impl<'de> Deserialize<'de> for MaskMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Word(String),
            Value(u32),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Word(w) => match w.as_str() {
                "none" => Ok(MaskMode::None),
                "auto" => Ok(MaskMode::Auto),
                "bbox" => Ok(MaskMode::Bbox),
                other => Err(serde::de::Error::custom(format!(
                    "mask must be none/auto/bbox or an integer margin, got '{}'",
                    other
                ))),
            },
            Repr::Value(v) => Ok(MaskMode::Margin(v)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_passes")]
    pub passes: u32,
    /// Maximum height of a column of contiguous vias. 0 is coerced to 1.
    #[serde(default = "default_max_stack")]
    pub max_stack: u8,
    #[serde(default = "default_via_pattern")]
    pub via_pattern: ViaPattern,
    #[serde(default = "default_mask")]
    pub mask: MaskMode,
    #[serde(default = "default_vdd")]
    pub vdd: String,
    #[serde(default = "default_gnd")]
    pub gnd: String,
    /// Nets never given to the maze engine.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Nets routed before everything else.
    #[serde(default)]
    pub priority: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            passes: default_passes(),
            max_stack: default_max_stack(),
            via_pattern: default_via_pattern(),
            mask: default_mask(),
            vdd: default_vdd(),
            gnd: default_gnd(),
            ignore: Vec::new(),
            priority: Vec::new(),
        }
    }
}

/// User keep-out rectangle, microns.
#[derive(Debug, Deserialize)]
pub struct ObstructionConfig {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub layer: String,
}

#[derive(Debug, Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub lef_files: Vec<String>,
    #[serde(default = "default_def_file")]
    pub def_file: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            lef_files: Vec::new(),
            def_file: default_def_file(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_def")]
    pub def_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            def_file: default_output_def(),
        }
    }
}

fn default_segment_cost() -> u32 {
    1
}

fn default_via_cost() -> u32 {
    5
}

fn default_jog_cost() -> u32 {
    10
}

fn default_crossover_cost() -> u32 {
    4
}

fn default_block_cost() -> u32 {
    25
}

fn default_conflict_cost() -> u32 {
    50
}

fn default_passes() -> u32 {
    10
}

fn default_max_stack() -> u8 {
    u8::MAX
}

fn default_via_pattern() -> ViaPattern {
    ViaPattern::None
}

fn default_mask() -> MaskMode {
    MaskMode::Auto
}

fn default_vdd() -> String {
    "vdd".to_string()
}

fn default_gnd() -> String {
    "gnd".to_string()
}

fn default_def_file() -> String {
    "inputs/placed.def".to_string()
}

fn default_output_def() -> String {
    "output/routed.def".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_costs() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.costs.segment, 1);
        assert_eq!(config.costs.via, 5);
        assert_eq!(config.costs.jog, 10);
        assert_eq!(config.costs.crossover, 4);
        assert_eq!(config.costs.block, 25);
        assert_eq!(config.costs.conflict, 50);
        assert_eq!(config.router.passes, 10);
    }

    #[test]
    fn zero_stack_is_coerced_to_one() {
        let config = Config::from_toml("[router]\nmax_stack = 0\n").unwrap();
        assert_eq!(config.router.max_stack, 1);
    }

    #[test]
    fn mask_accepts_word_or_margin() {
        let c = Config::from_toml("[router]\nmask = \"bbox\"\n").unwrap();
        assert_eq!(c.router.mask, MaskMode::Bbox);
        let c = Config::from_toml("[router]\nmask = 12\n").unwrap();
        assert_eq!(c.router.mask, MaskMode::Margin(12));
    }

    #[test]
    fn obstructions_parse() {
        let c = Config::from_toml(
            "[[obstruction]]\nx1 = 0.0\ny1 = 0.0\nx2 = 5.0\ny2 = 2.0\nlayer = \"metal1\"\n",
        )
        .unwrap();
        assert_eq!(c.obstruction.len(), 1);
        assert_eq!(c.obstruction[0].x2, 5.0);
    }
}
