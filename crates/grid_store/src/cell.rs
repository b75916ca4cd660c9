//! Grid coordinates, update events and snapshots.
//!
//! Wire formats:
//! - store key: `states:(<row>,<col>)`
//! - update event payload: `(<row>,<col>):<true|false>`
//! - snapshot: JSON object keyed by store key, e.g. `{"states:(0,0)":true}`

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Key prefix for cell bits: states:(row,col)
pub const STATE_KEY_PREFIX: &str = "states:";

/// Pattern enumerating every cell key.
pub const STATE_KEY_PATTERN: &str = "states:*";

/// Default topic carrying update events.
pub const UPDATES_TOPIC: &str = "checkbox_updates";

/// A `(row, column)` cell address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub row: u32,
    pub column: u32,
}

impl Coord {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }

    /// Validate signed user input into a coordinate.
    pub fn try_from_signed(row: i64, column: i64) -> Result<Self> {
        match (u32::try_from(row), u32::try_from(column)) {
            (Ok(r), Ok(c)) => Ok(Self::new(r, c)),
            _ => Err(Error::InvalidCoordinate { row, column }),
        }
    }

    /// Store key for this cell.
    pub fn store_key(&self) -> String {
        format!("{}{}", STATE_KEY_PREFIX, self)
    }

    /// Parse a store key back into a coordinate.
    pub fn from_store_key(key: &str) -> Result<Self> {
        key.strip_prefix(STATE_KEY_PREFIX)
            .ok_or_else(|| Error::MalformedKey(key.to_string()))?
            .parse()
            .map_err(|_| Error::MalformedKey(key.to_string()))
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.column)
    }
}

impl FromStr for Coord {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::MalformedKey(s.to_string());
        let inner = s
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(malformed)?;
        let (row, column) = inner.split_once(',').ok_or_else(malformed)?;
        let row = row.trim().parse().map_err(|_| malformed())?;
        let column = column.trim().parse().map_err(|_| malformed())?;
        Ok(Self::new(row, column))
    }
}

/// One cell transition. Applying it is an unconditional overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub row: u32,
    pub column: u32,
    pub value: bool,
}

impl UpdateEvent {
    pub fn new(coord: Coord, value: bool) -> Self {
        Self {
            row: coord.row,
            column: coord.column,
            value,
        }
    }

    pub fn coord(&self) -> Coord {
        Coord::new(self.row, self.column)
    }
}

impl fmt::Display for UpdateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.coord(), self.value)
    }
}

impl FromStr for UpdateEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (coord, value) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::MalformedEvent(s.to_string()))?;
        let coord: Coord = coord
            .parse()
            .map_err(|_| Error::MalformedEvent(s.to_string()))?;
        let value = match value.trim() {
            "true" => true,
            "false" => false,
            _ => return Err(Error::MalformedEvent(s.to_string())),
        };
        Ok(Self::new(coord, value))
    }
}

/// Point-in-time view of every initialized cell.
///
/// Serializes as a JSON object keyed by store key so viewers get the same
/// shape from the read endpoint and the initial WebSocket frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, bool>",
    into = "BTreeMap<String, bool>"
)]
pub struct GridSnapshot {
    cells: BTreeMap<Coord, bool>,
}

impl GridSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, coord: Coord, value: bool) {
        self.cells.insert(coord, value);
    }

    /// Value of a cell, `None` if the cell is not part of the snapshot.
    pub fn get(&self, coord: Coord) -> Option<bool> {
        self.cells.get(&coord).copied()
    }

    /// Overwrite the cell named by `event`.
    pub fn apply(&mut self, event: &UpdateEvent) {
        self.cells.insert(event.coord(), event.value);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Coord, bool)> + '_ {
        self.cells.iter().map(|(c, v)| (*c, *v))
    }

    /// Number of cells currently set to `true`.
    pub fn checked_count(&self) -> usize {
        self.cells.values().filter(|v| **v).count()
    }
}

impl FromIterator<(Coord, bool)> for GridSnapshot {
    fn from_iter<I: IntoIterator<Item = (Coord, bool)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

impl From<GridSnapshot> for BTreeMap<String, bool> {
    fn from(snapshot: GridSnapshot) -> Self {
        snapshot
            .cells
            .into_iter()
            .map(|(coord, value)| (coord.store_key(), value))
            .collect()
    }
}

impl TryFrom<BTreeMap<String, bool>> for GridSnapshot {
    type Error = Error;

    fn try_from(map: BTreeMap<String, bool>) -> Result<Self> {
        map.into_iter()
            .map(|(key, value)| Coord::from_store_key(&key).map(|coord| (coord, value)))
            .collect()
    }
}
