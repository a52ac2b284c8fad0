//! Payloads that flow between task graph nodes.

use forage_proto::{StateTile, TileId};
use serde::{Deserialize, Serialize};

use crate::{
    management::ManagementPolicy,
    taskgraph::{ArtifactKey, TaskError, TaskInputs},
    tiling::Direction,
};

/// Monthly climate for one tile. Precipitation in cm, temperatures in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcingTile {
    pub precipitation: Vec<f64>,
    pub min_temperature: Vec<f64>,
    pub max_temperature: Vec<f64>,
}

/// Static soil texture fractions for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteTile {
    pub clay: Vec<f64>,
    pub sand: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementTile {
    pub policy_index: Vec<u16>,
    pub policies: Vec<ManagementPolicy>,
}

impl ManagementTile {
    pub fn policy(&self, idx: usize) -> ManagementPolicy {
        self.policies[self.policy_index[idx] as usize]
    }
}

/// Live aboveground biomass along the four borders of a tile; `None` marks
/// inactive cells. Corners are the ends of `top` and `bottom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileEdges {
    pub tile: TileId,
    pub top: Vec<Option<f64>>,
    pub bottom: Vec<Option<f64>>,
    pub left: Vec<Option<f64>>,
    pub right: Vec<Option<f64>>,
}

impl TileEdges {
    pub fn of_state(state: &StateTile) -> Self {
        let live = |x: u32, y: u32| state.cell(x, y).map(|cell| cell.aboveground_live);
        let (w, h) = (state.width, state.height);
        Self {
            tile: state.tile,
            top: (0..w).map(|x| live(x, 0)).collect(),
            bottom: (0..w).map(|x| live(x, h - 1)).collect(),
            left: (0..h).map(|y| live(0, y)).collect(),
            right: (0..h).map(|y| live(w - 1, y)).collect(),
        }
    }
}

/// Per-cell diagnostics of one month. Inactive cells hold NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticTile {
    pub tile: TileId,
    pub width: u32,
    pub height: u32,
    pub standing_biomass: Vec<f64>,
    pub production: Vec<f64>,
    pub offtake: Vec<f64>,
    /// Offtake over demand; NaN where no animals were present.
    pub diet_sufficiency: Vec<f64>,
    pub aet: Vec<f64>,
}

impl DiagnosticTile {
    pub fn empty(tile: TileId, width: u32, height: u32) -> Self {
        let nan = vec![f64::NAN; width as usize * height as usize];
        Self {
            tile,
            width,
            height,
            standing_biomass: nan.clone(),
            production: nan.clone(),
            offtake: nan.clone(),
            diet_sufficiency: nan.clone(),
            aet: nan,
        }
    }

    /// The result layers written per month, in output order.
    pub fn layers(&self) -> [(&'static str, &[f64]); 4] {
        [
            ("standing_biomass", &self.standing_biomass),
            ("offtake", &self.offtake),
            ("production", &self.production),
            ("diet_sufficiency", &self.diet_sufficiency),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Artifact {
    State(StateTile),
    Forcing(ForcingTile),
    Site(SiteTile),
    Management(ManagementTile),
    Edges(TileEdges),
    Diagnostics(DiagnosticTile),
}

macro_rules! artifact_accessor {
    ($name:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $name<'a>(inputs: &'a TaskInputs<Artifact>, key: &ArtifactKey) -> Result<&'a $ty, TaskError> {
            match inputs.get(key)? {
                Artifact::$variant(value) => Ok(value),
                _ => Err(TaskError::InputType {
                    key: key.clone(),
                    expected: $label,
                }),
            }
        }
    };
}

impl Artifact {
    artifact_accessor!(state, State, StateTile, "state");
    artifact_accessor!(forcing, Forcing, ForcingTile, "forcing");
    artifact_accessor!(site, Site, SiteTile, "site");
    artifact_accessor!(management, Management, ManagementTile, "management");
    artifact_accessor!(edges, Edges, TileEdges, "edges");

    pub fn as_state(&self) -> Option<&StateTile> {
        match self {
            Artifact::State(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_diagnostics(&self) -> Option<&DiagnosticTile> {
        match self {
            Artifact::Diagnostics(diag) => Some(diag),
            _ => None,
        }
    }
}

/// Prior-month live biomass of a tile padded by one cell on every side.
/// Padding comes from neighbour edges; missing neighbours read as `None`.
#[derive(Debug, Clone)]
pub struct Halo {
    width: u32,
    height: u32,
    cells: Vec<Option<f64>>,
}

impl Halo {
    pub fn assemble(state: &StateTile, neighbors: &[(Direction, &TileEdges)]) -> Self {
        let (w, h) = (state.width, state.height);
        let mut halo = Self {
            width: w + 2,
            height: h + 2,
            cells: vec![None; (w as usize + 2) * (h as usize + 2)],
        };
        for y in 0..h {
            for x in 0..w {
                let value = state.cell(x, y).map(|cell| cell.aboveground_live);
                halo.set(x as i64, y as i64, value);
            }
        }
        let (wi, hi) = (w as i64, h as i64);
        for &(direction, edges) in neighbors {
            match direction {
                Direction::North => edges
                    .bottom
                    .iter()
                    .take(w as usize)
                    .enumerate()
                    .for_each(|(x, v)| halo.set(x as i64, -1, *v)),
                Direction::South => edges
                    .top
                    .iter()
                    .take(w as usize)
                    .enumerate()
                    .for_each(|(x, v)| halo.set(x as i64, hi, *v)),
                Direction::West => edges
                    .right
                    .iter()
                    .take(h as usize)
                    .enumerate()
                    .for_each(|(y, v)| halo.set(-1, y as i64, *v)),
                Direction::East => edges
                    .left
                    .iter()
                    .take(h as usize)
                    .enumerate()
                    .for_each(|(y, v)| halo.set(wi, y as i64, *v)),
                Direction::NorthWest => halo.set(-1, -1, edges.bottom.last().copied().flatten()),
                Direction::NorthEast => halo.set(wi, -1, edges.bottom.first().copied().flatten()),
                Direction::SouthWest => halo.set(-1, hi, edges.top.last().copied().flatten()),
                Direction::SouthEast => halo.set(wi, hi, edges.top.first().copied().flatten()),
            }
        }
        halo
    }

    fn set(&mut self, x: i64, y: i64, value: Option<f64>) {
        let idx = ((y + 1) * self.width as i64 + (x + 1)) as usize;
        self.cells[idx] = value;
    }

    /// Value at tile-local coordinates; -1 and `width`/`height` address the
    /// padding.
    pub fn get(&self, x: i64, y: i64) -> Option<f64> {
        if x < -1 || y < -1 || x > self.width as i64 - 2 || y > self.height as i64 - 2 {
            return None;
        }
        self.cells[((y + 1) * self.width as i64 + (x + 1)) as usize]
    }

    /// Mean live biomass over the active 8-neighbourhood of a cell.
    pub fn neighbor_mean(&self, x: u32, y: u32) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0u32;
        for direction in Direction::ALL {
            let (dx, dy) = direction.offset();
            if let Some(value) = self.get(x as i64 + dx as i64, y as i64 + dy as i64) {
                sum += value;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forage_proto::CellState;

    fn tile_with_live(tile: TileId, w: u32, h: u32, live: f64) -> StateTile {
        let mut state = StateTile::inactive(tile, w, h);
        for (active, cell) in state.mask.iter_mut().zip(state.cells.iter_mut()) {
            *active = true;
            *cell = CellState {
                aboveground_live: live,
                ..CellState::default()
            };
        }
        state
    }

    #[test]
    fn halo_reads_neighbour_borders() {
        let centre = tile_with_live(TileId::new(1, 1), 2, 2, 1.0);
        let north = TileEdges::of_state(&tile_with_live(TileId::new(1, 0), 2, 2, 5.0));
        let south_east = TileEdges::of_state(&tile_with_live(TileId::new(2, 2), 2, 2, 9.0));
        let halo = Halo::assemble(
            &centre,
            &[(Direction::North, &north), (Direction::SouthEast, &south_east)],
        );
        assert_eq!(halo.get(0, -1), Some(5.0));
        assert_eq!(halo.get(2, 2), Some(9.0));
        assert_eq!(halo.get(-1, 0), None);
        let mean = halo.neighbor_mean(0, 0).expect("neighbours");
        assert!((mean - (5.0 + 5.0 + 1.0 + 1.0 + 1.0) / 5.0).abs() < 1e-12, "{mean}");
    }

    #[test]
    fn edges_skip_inactive_cells() {
        let mut state = tile_with_live(TileId::new(0, 0), 3, 2, 2.0);
        state.mask[2] = false;
        let edges = TileEdges::of_state(&state);
        assert_eq!(edges.top, vec![Some(2.0), Some(2.0), None]);
        assert_eq!(edges.right, vec![None, Some(2.0)]);
    }
}
