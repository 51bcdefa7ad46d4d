//! Kalah board representation and move engine.
//!
//! The board is a plain value: sowing mutates it under the exclusive
//! ownership of a game runner, and `Clone` produces independent snapshots
//! (used by the database layer when replaying stored games).

use std::fmt;
use std::ops::Not;
use std::str::FromStr;

use rand::Rng;

/// One of the two board halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    North,
    South,
}

impl Not for Side {
    type Output = Side;

    fn not(self) -> Side {
        match self {
            Side::North => Side::South,
            Side::South => Side::North,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::North => write!(f, "north"),
            Side::South => write!(f, "south"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseBoardError {
    #[error("board field is not a number: {0}")]
    NotANumber(String),
    #[error("expected {expected} fields, got {got}")]
    WrongFieldCount { expected: usize, got: usize },
    #[error("board has no pits")]
    Empty,
}

/// A Kalah board with `size` pits per side.
///
/// Pits are 0-indexed in sowing direction; the opposite of south pit `i`
/// is north pit `size - 1 - i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    size: usize,
    init: u32,
    south: Vec<u32>,
    north: Vec<u32>,
    south_store: u32,
    north_store: u32,
}

impl Board {
    /// A fresh board with `init` stones in each of the `2 * size` pits.
    pub fn new(size: usize, init: u32) -> Board {
        assert!(size >= 1, "board needs at least one pit per side");
        Board {
            size,
            init,
            south: vec![init; size],
            north: vec![init; size],
            south_store: 0,
            north_store: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn init(&self) -> u32 {
        self.init
    }

    pub fn pits(&self, side: Side) -> &[u32] {
        match side {
            Side::North => &self.north,
            Side::South => &self.south,
        }
    }

    pub fn store(&self, side: Side) -> u32 {
        match side {
            Side::North => self.north_store,
            Side::South => self.south_store,
        }
    }

    fn pits_mut(&mut self, side: Side) -> &mut Vec<u32> {
        match side {
            Side::North => &mut self.north,
            Side::South => &mut self.south,
        }
    }

    fn store_mut(&mut self, side: Side) -> &mut u32 {
        match side {
            Side::North => &mut self.north_store,
            Side::South => &mut self.south_store,
        }
    }

    /// True iff `pit` names a non-empty pit on `side`.
    ///
    /// Turn ownership is tracked by the game runner, not the board.
    pub fn legal(&self, side: Side, pit: usize) -> bool {
        pit < self.size && self.pits(side)[pit] > 0
    }

    /// Sow the stones of `(side, pit)` counter-clockwise, skipping the
    /// opponent's store. Applies the capture rule (last stone into an own
    /// empty pit with a non-empty opposite) and the sweep rule (a side
    /// running empty ends the game, the opponent keeps their remainder).
    ///
    /// Returns true when the last stone landed in the mover's store and the
    /// same side moves again.
    ///
    /// # Panics
    ///
    /// The move must be legal.
    pub fn sow(&mut self, side: Side, pit: usize) -> bool {
        assert!(
            self.legal(side, pit),
            "illegal move: {side} pit {pit} on [{self}]"
        );

        let mut stones = std::mem::take(&mut self.pits_mut(side)[pit]);

        // Walk (half, index) positions; index == size addresses the store
        // of that half, and the opponent's store is stepped over.
        let mut half = side;
        let mut idx = pit;
        while stones > 0 {
            if idx < self.size {
                idx += 1;
            } else {
                half = !half;
                idx = 0;
            }
            if idx == self.size {
                if half != side {
                    // Never drop into the opponent's store.
                    half = !half;
                    idx = 0;
                } else {
                    *self.store_mut(side) += 1;
                    stones -= 1;
                    continue;
                }
            }
            self.pits_mut(half)[idx] += 1;
            stones -= 1;
        }

        let again = idx == self.size;

        if !again && half == side && self.pits(side)[idx] == 1 {
            let opposite = self.size - 1 - idx;
            if self.pits(!side)[opposite] > 0 {
                let captured = std::mem::take(&mut self.pits_mut(!side)[opposite])
                    + std::mem::take(&mut self.pits_mut(side)[idx]);
                *self.store_mut(side) += captured;
            }
        }

        for empty in [Side::North, Side::South] {
            if self.pits(empty).iter().all(|&p| p == 0) {
                let rest: u32 = self.pits_mut(!empty).drain(..).sum();
                *self.pits_mut(!empty) = vec![0; self.size];
                *self.store_mut(!empty) += rest;
                break;
            }
        }

        again
    }

    /// True once either side's pits are all empty.
    pub fn over(&self) -> bool {
        self.south.iter().all(|&p| p == 0) || self.north.iter().all(|&p| p == 0)
    }

    /// The winning side, or `None` for a draw. Only meaningful once
    /// [`Board::over`] holds.
    pub fn outcome(&self) -> Option<Side> {
        debug_assert!(self.over(), "outcome of an unfinished board");
        match self.south_store.cmp(&self.north_store) {
            std::cmp::Ordering::Greater => Some(Side::South),
            std::cmp::Ordering::Less => Some(Side::North),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The same position with north and south exchanged.
    pub fn mirror(&self) -> Board {
        Board {
            size: self.size,
            init: self.init,
            south: self.north.clone(),
            north: self.south.clone(),
            south_store: self.north_store,
            north_store: self.south_store,
        }
    }

    /// A uniformly random legal pit for `side`, the substitute when a
    /// client fails to decide in time.
    ///
    /// # Panics
    ///
    /// `side` must have at least one legal move.
    pub fn random(&self, side: Side) -> usize {
        let legal: Vec<usize> = (0..self.size).filter(|&p| self.legal(side, p)).collect();
        assert!(!legal.is_empty(), "no legal move for {side} on [{self}]");
        legal[rand::thread_rng().gen_range(0..legal.len())]
    }

    #[cfg(test)]
    fn total(&self) -> u32 {
        self.south.iter().sum::<u32>()
            + self.north.iter().sum::<u32>()
            + self.south_store
            + self.north_store
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.size, self.south_store, self.north_store
        )?;
        for pit in self.south.iter().chain(self.north.iter()) {
            write!(f, " {pit}")?;
        }
        Ok(())
    }
}

impl FromStr for Board {
    type Err = ParseBoardError;

    fn from_str(s: &str) -> Result<Board, ParseBoardError> {
        let fields: Vec<u32> = s
            .split_whitespace()
            .map(|w| {
                w.parse()
                    .map_err(|_| ParseBoardError::NotANumber(w.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let &[size, south_store, north_store, ..] = fields.as_slice() else {
            return Err(ParseBoardError::Empty);
        };
        let size = size as usize;
        if size == 0 {
            return Err(ParseBoardError::Empty);
        }
        if fields.len() != 3 + 2 * size {
            return Err(ParseBoardError::WrongFieldCount {
                expected: 3 + 2 * size,
                got: fields.len(),
            });
        }
        let south = fields[3..3 + size].to_vec();
        let north = fields[3 + size..].to_vec();
        // The initial fill is not part of the wire form; derive it so that
        // stone conservation can still be checked against the total.
        let total: u32 =
            south.iter().sum::<u32>() + north.iter().sum::<u32>() + south_store + north_store;
        Ok(Board {
            size,
            init: total / (2 * size as u32),
            south,
            north,
            south_store,
            north_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(s: &str) -> Board {
        s.parse().expect("test board")
    }

    #[test]
    fn initial_board_is_balanced() {
        let b = Board::new(3, 3);
        assert_eq!(b.to_string(), "3 0 0 3 3 3 3 3 3");
        assert_eq!(b.total(), 18);
    }

    #[test]
    fn sowing_into_own_store_grants_another_turn() {
        // South opens with pit 0: stones land in pits 1, 2 and the store.
        let mut b = Board::new(3, 3);
        let again = b.sow(Side::South, 0);
        assert!(again);
        assert_eq!(b.to_string(), "3 1 0 0 4 4 3 3 3");
        assert_eq!(b.total(), 18);
    }

    #[test]
    fn sowing_past_the_store_continues_on_the_opponent_side() {
        let mut b = Board::new(3, 3);
        b.sow(Side::South, 0);
        let again = b.sow(Side::South, 1);
        assert!(!again);
        assert_eq!(b.to_string(), "3 2 0 0 0 5 4 4 3");
        assert_eq!(b.total(), 18);
    }

    #[test]
    fn long_sow_skips_the_opponent_store() {
        // Ten stones from south pit 0 wrap around the whole board; the
        // north store must be stepped over on the way.
        let mut b = board("3 0 0 10 0 0 0 0 0");
        b.sow(Side::South, 0);
        assert_eq!(b.store(Side::North), 0);
        // s1 s2 store n0 n1 n2 s0 s1 s2 store
        assert_eq!(b.store(Side::South), 2);
        assert_eq!(b.pits(Side::South), &[1, 2, 2]);
        assert_eq!(b.pits(Side::North), &[1, 1, 1]);
    }

    #[test]
    fn capture_takes_own_and_opposite_stones() {
        // South's last stone lands in empty pit 1; north's opposite pit
        // (index 1) holds four stones.
        let mut b = board("3 0 0 1 0 2 2 4 2");
        let again = b.sow(Side::South, 0);
        assert!(!again);
        assert_eq!(b.store(Side::South), 5);
        assert_eq!(b.pits(Side::South), &[0, 0, 2]);
        assert_eq!(b.pits(Side::North), &[2, 0, 2]);
    }

    #[test]
    fn no_capture_when_the_opposite_pit_is_empty() {
        let mut b = board("3 0 0 1 0 2 2 0 2");
        b.sow(Side::South, 0);
        assert_eq!(b.store(Side::South), 0);
        assert_eq!(b.pits(Side::South), &[0, 1, 2]);
    }

    #[test]
    fn emptying_a_side_sweeps_the_remainder() {
        let mut b = board("2 3 0 0 1 2 2");
        let again = b.sow(Side::South, 1);
        assert!(again);
        assert!(b.over());
        assert_eq!(b.store(Side::South), 4);
        assert_eq!(b.store(Side::North), 4);
        assert_eq!(b.outcome(), None);
    }

    #[test]
    fn sweep_can_decide_the_game() {
        let mut b = board("2 5 0 0 1 1 1");
        b.sow(Side::South, 1);
        assert!(b.over());
        assert_eq!(b.outcome(), Some(Side::South));
    }

    #[test]
    fn stones_are_conserved_across_random_play() {
        let mut b = Board::new(8, 8);
        let mut side = Side::South;
        while !b.over() {
            let pit = b.random(side);
            let again = b.sow(side, pit);
            assert_eq!(b.total(), 2 * 8 * 8);
            if !again {
                side = !side;
            }
        }
        assert_eq!(b.total(), 2 * 8 * 8);
    }

    #[test]
    fn random_only_returns_legal_pits() {
        let b = board("3 0 0 0 2 0 1 1 1");
        for _ in 0..32 {
            assert_eq!(b.random(Side::South), 1);
        }
    }

    #[test]
    fn mirror_swaps_perspectives() {
        let mut b = Board::new(3, 3);
        b.sow(Side::South, 0);
        assert_eq!(b.mirror().to_string(), "3 0 1 3 3 3 0 4 4");
        assert_eq!(b.mirror().mirror(), b);
    }

    #[test]
    fn canonical_string_round_trips() {
        let mut b = Board::new(4, 5);
        b.sow(Side::South, 2);
        let parsed: Board = b.to_string().parse().expect("round trip");
        assert_eq!(parsed, b);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!("".parse::<Board>().is_err());
        assert!("3 0 0 1 2".parse::<Board>().is_err());
        assert!("3 0 x 1 2 3 4 5 6".parse::<Board>().is_err());
    }
}
