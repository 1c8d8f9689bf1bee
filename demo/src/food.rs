//! Lunch orders as the agreed value.

use std::fmt;

use fbas::Value;
use rand::{Rng, seq::SliceRandom};

/// What the office orders for lunch.
///
/// When several orders are confirmed for the same day, the one listed last
/// here wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Food {
    /// Pizza.
    Pizza,
    /// Burgers.
    Burgers,
    /// Burritos.
    Burritos,
    /// Sandwiches.
    Sandwiches,
    /// Sushi.
    Sushi,
    /// Salads.
    Salads,
    /// Gyros.
    Gyros,
    /// Indian.
    Indian,
    /// Soup.
    Soup,
    /// Pasta.
    Pasta,
}

impl Food {
    /// Every option on the menu.
    pub const ALL: [Self; 10] = [
        Self::Pizza,
        Self::Burgers,
        Self::Burritos,
        Self::Sandwiches,
        Self::Sushi,
        Self::Salads,
        Self::Gyros,
        Self::Indian,
        Self::Soup,
        Self::Pasta,
    ];

    /// Picks a craving at random.
    pub fn random(rng: &mut impl Rng) -> Self {
        Self::ALL.choose(rng).copied().unwrap_or(Self::Pizza)
    }
}

impl Value for Food {
    fn combine(&self, other: &Self) -> Self {
        (*self).max(*other)
    }

    fn bytes(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl fmt::Display for Food {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pizza => "pizza",
            Self::Burgers => "burgers",
            Self::Burritos => "burritos",
            Self::Sandwiches => "sandwiches",
            Self::Sushi => "sushi",
            Self::Salads => "salads",
            Self::Gyros => "gyros",
            Self::Indian => "indian",
            Self::Soup => "soup",
            Self::Pasta => "pasta",
        };
        f.write_str(name)
    }
}
