//! Compile-time macro bag handed to the device kernel compiler.

use std::collections::BTreeMap;
use std::fmt;

use primkit_layout::Tile;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MacroValue {
    Int(i64),
    Str(String),
    /// Bare `-D NAME` option.
    Flag,
}

/// Ordered key/value map of kernel macros plus the source unit they apply to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KernelCtx {
    source: String,
    macros: BTreeMap<String, MacroValue>,
}

impl KernelCtx {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            macros: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn define_int(&mut self, name: &str, value: impl Into<i64>) {
        self.macros
            .insert(name.to_string(), MacroValue::Int(value.into()));
    }

    pub fn define_str(&mut self, name: &str, value: impl Into<String>) {
        self.macros
            .insert(name.to_string(), MacroValue::Str(value.into()));
    }

    pub fn add_option(&mut self, name: &str) {
        self.macros.insert(name.to_string(), MacroValue::Flag);
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.macros.get(name) {
            Some(MacroValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.macros.get(name) {
            Some(MacroValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    /// Defines `<PREFIX>_<LETTER>` for every axis of `tile`.
    pub fn define_tile(&mut self, prefix: &str, tile: &Tile) {
        for (letter, size) in tile.iter() {
            let name = format!("{prefix}_{}", letter.to_ascii_uppercase());
            self.define_int(&name, size as i64);
        }
    }

    /// Reads back a tile written by [`KernelCtx::define_tile`].
    pub fn tile(&self, prefix: &str) -> Tile {
        let head = format!("{prefix}_");
        let mut tile = Tile::new();
        for (name, value) in &self.macros {
            let Some(rest) = name.strip_prefix(&head) else {
                continue;
            };
            let mut chars = rest.chars();
            if let (Some(letter), None, MacroValue::Int(v)) = (chars.next(), chars.next(), value) {
                if letter.is_ascii_uppercase() && *v > 0 {
                    tile.set(letter.to_ascii_lowercase(), *v as usize);
                }
            }
        }
        tile
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Compiler option string, e.g. `-DSIMD=16 -DDT_F32`.
    pub fn options(&self) -> String {
        let mut out = Vec::with_capacity(self.macros.len());
        for (name, value) in &self.macros {
            match value {
                MacroValue::Int(v) => out.push(format!("-D{name}={v}")),
                MacroValue::Str(v) => out.push(format!("-D{name}={v}")),
                MacroValue::Flag => out.push(format!("-D{name}")),
            }
        }
        out.join(" ")
    }
}

impl fmt::Display for KernelCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.source, self.options())
    }
}
