//! Serialized records shared by the forage engine, its checkpoints and its
//! on-disk raster container.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of soil water layers tracked per cell.
pub const SOIL_LAYERS: usize = 2;

/// SHA-256 identity of a computation's full input closure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// First twelve hex digits, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintParseError {
    #[error("fingerprint must be 64 hex digits, got {0}")]
    Length(usize),
    #[error("invalid hex digit in fingerprint at offset {0}")]
    Digit(usize),
}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(FingerprintParseError::Length(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, slot) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *slot = u8::from_str_radix(pair, 16)
                .map_err(|_| FingerprintParseError::Digit(i * 2))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Incremental fingerprint construction.
///
/// Every field is written length-prefixed under its name so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub struct FingerprintBuilder {
    hasher: Sha256,
}

impl FingerprintBuilder {
    pub fn new(domain: &str) -> Self {
        let mut builder = Self {
            hasher: Sha256::new(),
        };
        builder.bytes("domain", domain.as_bytes());
        builder
    }

    pub fn bytes(&mut self, name: &str, data: &[u8]) -> &mut Self {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn str(&mut self, name: &str, value: &str) -> &mut Self {
        self.bytes(name, value.as_bytes())
    }

    pub fn u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.bytes(name, &value.to_le_bytes())
    }

    pub fn f64s(&mut self, name: &str, values: &[f64]) -> &mut Self {
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update((values.len() as u64).to_le_bytes());
        for value in values {
            self.hasher.update(value.to_bits().to_le_bytes());
        }
        self
    }

    pub fn fingerprint(&mut self, name: &str, value: &Fingerprint) -> &mut Self {
        self.bytes(name, value.as_bytes())
    }

    pub fn value<T: Serialize>(&mut self, name: &str, value: &T) -> bincode::Result<&mut Self> {
        let encoded = bincode::serialize(value)?;
        Ok(self.bytes(name, &encoded))
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

/// Ecosystem pools of one grid cell. Masses in g/m², water in cm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CellState {
    pub aboveground_live: f64,
    pub standing_dead: f64,
    pub root_biomass: f64,
    pub litter: f64,
    pub soil_organic: f64,
    pub mineral_n: f64,
    pub soil_water: [f64; SOIL_LAYERS],
}

impl CellState {
    /// Forage available to grazers: live plus standing dead.
    pub fn standing_biomass(&self) -> f64 {
        self.aboveground_live + self.standing_dead
    }

    /// Sum of every organic pool.
    pub fn total_organic(&self) -> f64 {
        self.aboveground_live
            + self.standing_dead
            + self.root_biomass
            + self.litter
            + self.soil_organic
    }

    pub fn total_water(&self) -> f64 {
        self.soil_water.iter().sum()
    }

    pub fn is_finite(&self) -> bool {
        [
            self.aboveground_live,
            self.standing_dead,
            self.root_biomass,
            self.litter,
            self.soil_organic,
            self.mineral_n,
        ]
        .iter()
        .chain(self.soil_water.iter())
        .all(|value| value.is_finite())
    }
}

/// Column/row address of a tile in the run's tile layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub col: u32,
    pub row: u32,
}

impl TileId {
    pub const fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}r{}", self.col, self.row)
    }
}

/// Row-major cell states of one tile. Inactive (nodata) cells keep a default
/// state and are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTile {
    pub tile: TileId,
    pub width: u32,
    pub height: u32,
    pub mask: Vec<bool>,
    pub cells: Vec<CellState>,
}

impl StateTile {
    pub fn inactive(tile: TileId, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        Self {
            tile,
            width,
            height,
            mask: vec![false; len],
            cells: vec![CellState::default(); len],
        }
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y as usize * self.width as usize + x as usize
    }

    pub fn cell(&self, x: u32, y: u32) -> Option<&CellState> {
        let idx = self.index(x, y);
        if self.mask[idx] {
            Some(&self.cells[idx])
        } else {
            None
        }
    }

    pub fn active_count(&self) -> usize {
        self.mask.iter().filter(|active| **active).count()
    }

    /// Deterministic content digest used by checkpoint manifests.
    pub fn digest(&self) -> bincode::Result<u64> {
        Ok(content_digest(&bincode::serialize(self)?))
    }
}

/// A state tile together with the fingerprint of the computation that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub fingerprint: Fingerprint,
    pub state: StateTile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCheckpoint {
    pub tile: TileId,
    pub fingerprint: Fingerprint,
    pub digest: u64,
}

/// Handle to a complete state-as-of snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointToken {
    pub timestep: u32,
    pub regions: Vec<RegionCheckpoint>,
    pub hash: u64,
}

impl CheckpointToken {
    pub fn new(timestep: u32, mut regions: Vec<RegionCheckpoint>) -> bincode::Result<Self> {
        regions.sort_unstable_by_key(|region| region.tile);
        Self {
            timestep,
            regions,
            hash: 0,
        }
        .finalize()
    }

    pub fn finalize(mut self) -> bincode::Result<Self> {
        self.hash = hash_checkpoint(&self)?;
        Ok(self)
    }

    /// A token that cannot be re-encoded is not intact either.
    pub fn is_intact(&self) -> bool {
        matches!(hash_checkpoint(self), Ok(hash) if hash == self.hash)
    }
}

pub fn hash_checkpoint(token: &CheckpointToken) -> bincode::Result<u64> {
    let mut clone = token.clone();
    clone.hash = 0;
    Ok(content_digest(&bincode::serialize(&clone)?))
}

/// Affine pixel-to-map transform of a north-up grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn cell_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Georeference {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub projection: Option<String>,
}

/// Location of one block payload inside a tiled raster container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndex {
    pub offset: u64,
    pub len: u32,
    pub checksum: u64,
}

/// Header of the native tiled raster container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterHeader {
    pub version: u16,
    pub id: String,
    pub georef: Georeference,
    pub nodata: Option<f64>,
    pub block_width: u32,
    pub block_height: u32,
    pub blocks: Vec<BlockIndex>,
}

impl RasterHeader {
    pub fn blocks_across(&self) -> u32 {
        self.georef.width.div_ceil(self.block_width)
    }

    pub fn blocks_down(&self) -> u32 {
        self.georef.height.div_ceil(self.block_height)
    }
}

/// First eight bytes (little-endian) of the SHA-256 of `bytes`. Stable
/// across hosts and releases, so it is safe to persist.
pub fn content_digest(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

pub fn encode_stored_state(state: &StoredState) -> bincode::Result<Vec<u8>> {
    bincode::serialize(state)
}

pub fn decode_stored_state(data: &[u8]) -> bincode::Result<StoredState> {
    bincode::deserialize(data)
}

pub fn encode_checkpoint_json(token: &CheckpointToken) -> serde_json::Result<String> {
    serde_json::to_string_pretty(token)
}

pub fn decode_checkpoint_json(data: &str) -> serde_json::Result<CheckpointToken> {
    serde_json::from_str(data)
}
