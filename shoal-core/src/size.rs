//! Rendition size descriptors parsed from URL segments.

use crate::error::{Result, ShoalError};
use std::fmt;
use std::str::FromStr;

/// A size descriptor: `full`, `100s` (square crop), `100w`
/// (width-constrained), or `100h` (height-constrained). The string form
/// is stable and doubles as a cache-key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeSpec {
    Full,
    Square(u32),
    Width(u32),
    Height(u32),
}

impl SizeSpec {
    pub fn is_full(&self) -> bool {
        matches!(self, SizeSpec::Full)
    }
}

impl FromStr for SizeSpec {
    type Err = ShoalError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "full" {
            return Ok(SizeSpec::Full);
        }
        let (digits, suffix) = s.split_at(s.len().saturating_sub(1));
        let pixels: u32 = digits
            .parse()
            .map_err(|_| ShoalError::BadRequest(format!("bad size: {}", s)))?;
        if pixels == 0 {
            return Err(ShoalError::BadRequest(format!("bad size: {}", s)));
        }
        match suffix {
            "s" => Ok(SizeSpec::Square(pixels)),
            "w" => Ok(SizeSpec::Width(pixels)),
            "h" => Ok(SizeSpec::Height(pixels)),
            _ => Err(ShoalError::BadRequest(format!("bad size: {}", s))),
        }
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeSpec::Full => f.write_str("full"),
            SizeSpec::Square(n) => write!(f, "{}s", n),
            SizeSpec::Width(n) => write!(f, "{}w", n),
            SizeSpec::Height(n) => write!(f, "{}h", n),
        }
    }
}
