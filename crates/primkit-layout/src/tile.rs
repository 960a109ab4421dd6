//! Sparse per-axis tiles.
//!
//! A tile maps axis letters to a positive size; missing axes default to 1.
//! Text form lists `letter size` pairs in letter order: `a16b4`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Iteration-space granularity of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Tile {
    dims: BTreeMap<char, usize>,
}

impl Tile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I: IntoIterator<Item = (char, usize)>>(pairs: I) -> Self {
        let mut tile = Self::new();
        for (letter, size) in pairs {
            tile.set(letter, size);
        }
        tile
    }

    pub fn get(&self, letter: char, default: usize) -> usize {
        self.dims.get(&letter).copied().unwrap_or(default)
    }

    /// Sets `letter` to `size`; a size of 1 removes the entry.
    pub fn set(&mut self, letter: char, size: usize) {
        assert!(size > 0, "tile size for '{letter}' must be positive");
        if size == 1 {
            self.dims.remove(&letter);
        } else {
            self.dims.insert(letter, size);
        }
    }

    pub fn with(mut self, letter: char, size: usize) -> Self {
        self.set(letter, size);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn letters(&self) -> impl Iterator<Item = char> + '_ {
        self.dims.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, usize)> + '_ {
        self.dims.iter().map(|(k, v)| (*k, *v))
    }

    /// Product of all sizes.
    pub fn elems(&self) -> usize {
        self.dims.values().product()
    }

    /// Per-axis product: `self[d] * other[d]` over the union of axes.
    pub fn mul(&self, other: &Tile) -> Tile {
        let mut out = self.clone();
        for (letter, size) in other.iter() {
            out.set(letter, self.get(letter, 1) * size);
        }
        out
    }

    /// True when every axis of `self` divides the matching axis of `other`.
    pub fn divides(&self, other: &Tile) -> bool {
        self.iter()
            .all(|(letter, size)| other.get(letter, 1).is_multiple_of(size))
    }

    /// Axis with the largest size; ties go to the later letter.
    pub fn largest(&self) -> Option<(char, usize)> {
        self.iter().max_by_key(|(letter, size)| (*size, *letter))
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("1");
        }
        for (letter, size) in self.iter() {
            write!(f, "{letter}{size}")?;
        }
        Ok(())
    }
}

impl FromStr for Tile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tile = Tile::new();
        if s == "1" || s.is_empty() {
            return Ok(tile);
        }
        let mut chars = s.chars().peekable();
        while let Some(letter) = chars.next() {
            if !letter.is_ascii_lowercase() {
                return Err(format!("bad tile letter '{letter}' in '{s}'"));
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().filter(|c| c.is_ascii_digit()) {
                digits.push(*d);
                chars.next();
            }
            let size: usize = digits
                .parse()
                .map_err(|_| format!("missing size after '{letter}' in '{s}'"))?;
            if size == 0 {
                return Err(format!("zero size for '{letter}' in '{s}'"));
            }
            if tile.dims.contains_key(&letter) {
                return Err(format!("duplicate letter '{letter}' in '{s}'"));
            }
            tile.set(letter, size);
        }
        Ok(tile)
    }
}

impl From<Tile> for String {
    fn from(tile: Tile) -> Self {
        tile.to_string()
    }
}

impl TryFrom<String> for Tile {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_default() {
        let t = Tile::from_pairs([('a', 16), ('c', 4)]);
        assert_eq!(t.get('a', 1), 16);
        assert_eq!(t.get('b', 1), 1);
        assert_eq!(t.get('b', 7), 7);
    }

    #[test]
    fn test_effective_tile() {
        let iter = Tile::from_pairs([('a', 4), ('b', 8)]);
        let tg = Tile::from_pairs([('b', 2), ('c', 16)]);
        let eff = iter.mul(&tg);
        assert_eq!(eff, Tile::from_pairs([('a', 4), ('b', 16), ('c', 16)]));
        assert_eq!(eff.elems(), 4 * 16 * 16);
    }

    #[test]
    fn test_text_roundtrip() {
        let t: Tile = "a16b4".parse().unwrap();
        assert_eq!(t.to_string(), "a16b4");
        assert_eq!(Tile::new().to_string(), "1");
        assert_eq!("1".parse::<Tile>().unwrap(), Tile::new());
        assert!("a0".parse::<Tile>().is_err());
        assert!("ab4".parse::<Tile>().is_err());
        assert!("a4a8".parse::<Tile>().is_err());
    }

    #[test]
    fn test_divides_and_largest() {
        let t = Tile::from_pairs([('a', 4), ('b', 8)]);
        assert!(t.divides(&Tile::from_pairs([('a', 16), ('b', 8)])));
        assert!(!t.divides(&Tile::from_pairs([('a', 6), ('b', 8)])));
        assert_eq!(t.largest(), Some(('b', 8)));
        assert_eq!(Tile::new().largest(), None);
    }
}
