//! Predicates a kernel demands of problem dimensions.

use std::fmt;
use std::str::FromStr;

use primkit_core::{PrimError, Result};
use primkit_layout::Problem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Predicate {
    DivisibleBy(usize),
    AtLeast(usize),
    AtMost(usize),
    Equals(usize),
}

impl Predicate {
    pub fn holds(&self, value: usize) -> bool {
        match *self {
            Predicate::DivisibleBy(k) => k != 0 && value.is_multiple_of(k),
            Predicate::AtLeast(k) => value >= k,
            Predicate::AtMost(k) => value <= k,
            Predicate::Equals(k) => value == k,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Requirement {
    pub dim: String,
    pub pred: Predicate,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pred {
            Predicate::DivisibleBy(k) => write!(f, "{}%{k}==0", self.dim),
            Predicate::AtLeast(k) => write!(f, "{}>={k}", self.dim),
            Predicate::AtMost(k) => write!(f, "{}<={k}", self.dim),
            Predicate::Equals(k) => write!(f, "{}=={k}", self.dim),
        }
    }
}

impl FromStr for Requirement {
    type Err = PrimError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || PrimError::invalid(format!("malformed requirement '{s}'"));
        let number = |v: &str| v.trim().parse::<usize>().map_err(|_| bad());
        let dim_name = |v: &str| {
            let v = v.trim();
            if v.is_empty() || !v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                Err(bad())
            } else {
                Ok(v.to_string())
            }
        };

        let (dim, pred) = if let Some((lhs, rhs)) = s.split_once('%') {
            let (k, zero) = rhs.split_once("==").ok_or_else(bad)?;
            if number(zero)? != 0 {
                return Err(bad());
            }
            (dim_name(lhs)?, Predicate::DivisibleBy(number(k)?))
        } else if let Some((lhs, rhs)) = s.split_once(">=") {
            (dim_name(lhs)?, Predicate::AtLeast(number(rhs)?))
        } else if let Some((lhs, rhs)) = s.split_once("<=") {
            (dim_name(lhs)?, Predicate::AtMost(number(rhs)?))
        } else if let Some((lhs, rhs)) = s.split_once("==") {
            (dim_name(lhs)?, Predicate::Equals(number(rhs)?))
        } else {
            return Err(bad());
        };
        if pred == Predicate::DivisibleBy(0) {
            return Err(bad());
        }
        Ok(Requirement { dim, pred })
    }
}

/// Conjunction of [`Requirement`]s, kept sorted so equal sets render equally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Requirements(Vec<Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dim: &str, pred: Predicate) -> Self {
        self.push(dim, pred);
        self
    }

    pub fn push(&mut self, dim: &str, pred: Predicate) {
        let req = Requirement {
            dim: dim.to_string(),
            pred,
        };
        if let Err(pos) = self.0.binary_search(&req) {
            self.0.insert(pos, req);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.iter()
    }

    /// Evaluates against a dim lookup; an unknown dim fails the check.
    pub fn check<F: Fn(&str) -> Option<usize>>(&self, lookup: F) -> bool {
        self.0
            .iter()
            .all(|r| lookup(&r.dim).is_some_and(|v| r.pred.holds(v)))
    }

    pub fn fits(&self, problem: &Problem) -> bool {
        self.check(|d| problem.dim_value(d))
    }

    /// First violated requirement, for diagnostics.
    pub fn first_unmet(&self, problem: &Problem) -> Option<&Requirement> {
        self.0.iter().find(|r| {
            !problem
                .dim_value(&r.dim)
                .is_some_and(|v| r.pred.holds(v))
        })
    }

    /// Least common multiple of every `%` predicate on `dim` (1 if none).
    pub fn divisor(&self, dim: &str) -> usize {
        self.0
            .iter()
            .filter(|r| r.dim == dim)
            .filter_map(|r| match r.pred {
                Predicate::DivisibleBy(k) => Some(k),
                _ => None,
            })
            .fold(1, lcm)
    }

    /// Smallest admissible value for `dim` ignoring tiles.
    pub fn lower_bound(&self, dim: &str) -> usize {
        self.0
            .iter()
            .filter(|r| r.dim == dim)
            .filter_map(|r| match r.pred {
                Predicate::AtLeast(k) | Predicate::Equals(k) => Some(k),
                _ => None,
            })
            .max()
            .unwrap_or(1)
    }

    pub fn upper_bound(&self, dim: &str) -> Option<usize> {
        self.0
            .iter()
            .filter(|r| r.dim == dim)
            .filter_map(|r| match r.pred {
                Predicate::AtMost(k) | Predicate::Equals(k) => Some(k),
                _ => None,
            })
            .min()
    }

    pub fn fixed(&self, dim: &str) -> Option<usize> {
        self.0.iter().find_map(|r| match r.pred {
            Predicate::Equals(k) if r.dim == dim => Some(k),
            _ => None,
        })
    }
}

pub(crate) fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        0
    } else {
        a / gcd(a, b) * b
    }
}

impl fmt::Display for Requirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

impl FromStr for Requirements {
    type Err = PrimError;

    fn from_str(s: &str) -> Result<Self> {
        let mut reqs = Requirements::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let r: Requirement = part.parse()?;
            reqs.push(&r.dim, r.pred);
        }
        Ok(reqs)
    }
}
