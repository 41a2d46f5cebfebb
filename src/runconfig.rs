//! Per-run configuration payload for the companion mod.
//!
//! The payload is a Lua table literal the mod reads at startup. It embeds the
//! display flags for the run plus the accumulated map/chunk-cache state from
//! the previous snapshot — the feedback channel that lets the game skip
//! chunks that have not changed.
//!
//! All carried state is held as [`serde_json::Value`] and rendered through a
//! single JSON→Lua encoder; no string splicing of prior documents happens
//! anywhere.

use std::fmt::Write as _;

use serde_json::Value;

use crate::options::RenderOptions;

/// Connection-type entities considered when expanding the capture area.
pub const CONNECT_TYPES: [&str; 11] = [
    "lamp",
    "electric-pole",
    "radar",
    "straight-rail",
    "curved-rail",
    "rail-signal",
    "rail-chain-signal",
    "locomotive",
    "cargo-wagon",
    "fluid-wagon",
    "car",
];

#[derive(Clone, Debug)]
pub struct AutorunConfig {
    pub hd: bool,
    pub day: bool,
    pub night: bool,
    pub alt_mode: bool,
    pub tags: bool,
    pub around_tag_range: f64,
    pub around_build_range: f64,
    pub around_connect_range: f64,
    pub date: String,
    pub surfaces: Vec<String>,
    /// Timeline folder name, with a trailing slash.
    pub name: String,
    pub map_info: Value,
    pub chunk_cache: Value,
}

impl AutorunConfig {
    pub fn from_options(
        opts: &RenderOptions,
        foldername: &str,
        map_info: Value,
        chunk_cache: Value,
    ) -> Self {
        Self {
            hd: opts.hd,
            day: !opts.night_only,
            night: !opts.day_only,
            alt_mode: opts.alt_mode,
            tags: opts.tags,
            around_tag_range: opts.tag_range,
            around_build_range: opts.build_range,
            around_connect_range: opts.connect_range,
            date: opts.date.clone(),
            surfaces: opts.surfaces.clone(),
            name: format!("{foldername}/"),
            map_info,
            chunk_cache,
        }
    }

    /// Renders the full `fm.autorun` table literal.
    pub fn render(&self) -> String {
        let surfaces = if self.surfaces.is_empty() {
            "nil".to_string()
        } else {
            let quoted: Vec<String> = self.surfaces.iter().map(|s| lua_string(s)).collect();
            format!("{{{}}}", quoted.join(", "))
        };
        let connect_types: Vec<String> = CONNECT_TYPES.iter().map(|s| lua_string(s)).collect();

        let mut out = String::new();
        out.push_str("fm.autorun = {\n");
        let _ = writeln!(out, "HD = {},", self.hd);
        let _ = writeln!(out, "day = {},", self.day);
        let _ = writeln!(out, "night = {},", self.night);
        let _ = writeln!(out, "alt_mode = {},", self.alt_mode);
        let _ = writeln!(out, "tags = {},", self.tags);
        let _ = writeln!(out, "around_tag_range = {},", self.around_tag_range);
        let _ = writeln!(out, "around_build_range = {},", self.around_build_range);
        let _ = writeln!(out, "around_connect_range = {},", self.around_connect_range);
        let _ = writeln!(out, "connect_types = {{{}}},", connect_types.join(", "));
        let _ = writeln!(out, "date = {},", lua_string(&self.date));
        let _ = writeln!(out, "surfaces = {surfaces},");
        let _ = writeln!(out, "name = {},", lua_string(&self.name));
        let _ = writeln!(out, "mapInfo = {},", lua_value(&self.map_info));
        let _ = writeln!(out, "chunkCache = {},", lua_value(&self.chunk_cache));
        out.push('}');
        out
    }
}

/// Encodes a JSON value as a Lua literal.
///
/// Arrays become `{...}` sequences, objects become `["key"] = value` tables,
/// `null` becomes `nil`. Object keys are emitted in `serde_json`'s map order,
/// so identical input values always render identically.
pub fn lua_value(v: &Value) -> String {
    let mut out = String::new();
    encode(v, &mut out);
    out
}

fn encode(v: &Value, out: &mut String) {
    match v {
        Value::Null => out.push_str("nil"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => out.push_str(&lua_string(s)),
        Value::Array(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                encode(item, out);
            }
            out.push('}');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, value)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('[');
                out.push_str(&lua_string(key));
                out.push_str("] = ");
                encode(value, out);
            }
            out.push('}');
        }
    }
}

fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\{}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
