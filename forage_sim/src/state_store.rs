//! Write-once storage of per-tile ecosystem state, keyed by (tile, timestep).
//!
//! Write-once holds per store handle: one handle is one run. The disk store
//! keeps every state it was ever given under its fingerprint, so a later run
//! with different inputs gets a fresh handle over the same directory and
//! never collides with states an earlier run left behind.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::RwLock,
};

use forage_proto::{
    decode_checkpoint_json, decode_stored_state, encode_checkpoint_json, encode_stored_state,
    CheckpointToken, Fingerprint, RegionCheckpoint, StoredState, TileId,
};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state stored for tile {tile} at timestep {timestep}")]
    NotFound { tile: TileId, timestep: u32 },
    #[error("tile {tile} at timestep {timestep} already holds a different state")]
    Conflict { tile: TileId, timestep: u32 },
    #[error("no state stored at timestep {timestep}")]
    EmptySnapshot { timestep: u32 },
    #[error("stored state is corrupted: {reason}")]
    Corrupted { reason: String },
    #[error("state store I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode state: {0}")]
    Encode(String),
}

impl StateError {
    fn io(path: &Path, source: io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn encode(err: impl std::fmt::Display) -> Self {
        StateError::Encode(err.to_string())
    }
}

/// Every region of a run at one timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct StateAsOf {
    pub timestep: u32,
    pub states: BTreeMap<TileId, StoredState>,
}

pub trait StateStore: Send + Sync {
    fn get(&self, tile: TileId, timestep: u32) -> Result<StoredState, StateError>;

    /// Stores `state` once. Putting the same fingerprint again is a no-op.
    fn put(&self, tile: TileId, timestep: u32, state: StoredState) -> Result<(), StateError>;

    fn contains(&self, tile: TileId, timestep: u32) -> bool;

    /// Records a checkpoint over every tile stored at `timestep`.
    fn snapshot(&self, timestep: u32) -> Result<CheckpointToken, StateError>;

    fn checkpoints(&self) -> Result<Vec<CheckpointToken>, StateError>;

    /// Loads the state a checkpoint names for `tile` at `timestep`. A store
    /// that outlives its handles looks it up by `fingerprint` and adopts it
    /// as this handle's state.
    fn load(
        &self,
        tile: TileId,
        timestep: u32,
        _fingerprint: &Fingerprint,
    ) -> Result<StoredState, StateError> {
        self.get(tile, timestep)
    }

    /// Loads every region named by `token`, verifying each against it.
    fn restore(&self, token: &CheckpointToken) -> Result<StateAsOf, StateError> {
        if !token.is_intact() {
            return Err(StateError::Corrupted {
                reason: format!("checkpoint for timestep {} fails its hash", token.timestep),
            });
        }
        let mut states = BTreeMap::new();
        for region in &token.regions {
            let stored = self.load(region.tile, token.timestep, &region.fingerprint)?;
            let digest = stored.state.digest().map_err(StateError::encode)?;
            if stored.fingerprint != region.fingerprint || digest != region.digest {
                return Err(StateError::Corrupted {
                    reason: format!(
                        "tile {} at timestep {} does not match its checkpoint",
                        region.tile, token.timestep
                    ),
                });
            }
            states.insert(region.tile, stored);
        }
        tracing::info!(
            target: "forage::state",
            timestep = token.timestep,
            regions = states.len(),
            "state.restored"
        );
        Ok(StateAsOf {
            timestep: token.timestep,
            states,
        })
    }
}

fn check_write_once(
    existing: Option<&StoredState>,
    incoming: &StoredState,
    tile: TileId,
    timestep: u32,
) -> Result<bool, StateError> {
    match existing {
        None => Ok(true),
        Some(existing) if existing.fingerprint == incoming.fingerprint => Ok(false),
        Some(_) => Err(StateError::Conflict { tile, timestep }),
    }
}

fn region_checkpoint(tile: TileId, stored: &StoredState) -> Result<RegionCheckpoint, StateError> {
    Ok(RegionCheckpoint {
        tile,
        fingerprint: stored.fingerprint,
        digest: stored.state.digest().map_err(StateError::encode)?,
    })
}

fn timestep_range(timestep: u32) -> std::ops::RangeInclusive<(u32, TileId)> {
    (timestep, TileId::new(0, 0))..=(timestep, TileId::new(u32::MAX, u32::MAX))
}

/// One run's states, held in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: RwLock<BTreeMap<(u32, TileId), StoredState>>,
    checkpoints: RwLock<BTreeMap<u32, CheckpointToken>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.read().map(|states| states.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StateError {
    StateError::Corrupted {
        reason: "state store lock poisoned".to_string(),
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, tile: TileId, timestep: u32) -> Result<StoredState, StateError> {
        let states = self.states.read().map_err(|_| poisoned())?;
        states
            .get(&(timestep, tile))
            .cloned()
            .ok_or(StateError::NotFound { tile, timestep })
    }

    fn put(&self, tile: TileId, timestep: u32, state: StoredState) -> Result<(), StateError> {
        let mut states = self.states.write().map_err(|_| poisoned())?;
        if check_write_once(states.get(&(timestep, tile)), &state, tile, timestep)? {
            states.insert((timestep, tile), state);
        }
        Ok(())
    }

    fn contains(&self, tile: TileId, timestep: u32) -> bool {
        self.states
            .read()
            .map(|states| states.contains_key(&(timestep, tile)))
            .unwrap_or(false)
    }

    fn snapshot(&self, timestep: u32) -> Result<CheckpointToken, StateError> {
        let states = self.states.read().map_err(|_| poisoned())?;
        let regions = states
            .range(timestep_range(timestep))
            .map(|((_, tile), stored)| region_checkpoint(*tile, stored))
            .collect::<Result<Vec<_>, _>>()?;
        if regions.is_empty() {
            return Err(StateError::EmptySnapshot { timestep });
        }
        let token = CheckpointToken::new(timestep, regions).map_err(StateError::encode)?;
        self.checkpoints
            .write()
            .map_err(|_| poisoned())?
            .insert(timestep, token.clone());
        Ok(token)
    }

    fn checkpoints(&self) -> Result<Vec<CheckpointToken>, StateError> {
        Ok(self
            .checkpoints
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }
}

/// What one handle has put or restored at a (timestep, tile).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    fingerprint: Fingerprint,
    digest: u64,
}

/// State files under `root/t{timestep}/{tile}/{fingerprint}.state`,
/// checkpoint manifests under `root/checkpoints/`. Files are renamed into
/// place so readers never observe a partial write.
///
/// Files are shared by every handle over `root`; the (tile, timestep) view
/// is per handle. A reopened handle sees nothing until it puts or restores.
#[derive(Debug)]
pub struct DiskStateStore {
    root: PathBuf,
    heads: RwLock<BTreeMap<(u32, TileId), Head>>,
}

impl DiskStateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        fs::create_dir_all(root.join("checkpoints")).map_err(|err| StateError::io(&root, err))?;
        Ok(Self {
            root,
            heads: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, tile: TileId, timestep: u32, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(format!("t{timestep:04}"))
            .join(tile.to_string())
            .join(format!("{fingerprint}.state"))
    }

    fn manifest_path(&self, timestep: u32) -> PathBuf {
        self.root.join("checkpoints").join(format!("t{timestep:04}.json"))
    }

    fn head(&self, tile: TileId, timestep: u32) -> Result<Option<Head>, StateError> {
        let heads = self.heads.read().map_err(|_| poisoned())?;
        Ok(heads.get(&(timestep, tile)).copied())
    }

    /// Reads the file for `fingerprint`, checking it holds what it is named for.
    fn read_state(
        &self,
        tile: TileId,
        timestep: u32,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StoredState>, StateError> {
        let path = self.state_path(tile, timestep, fingerprint);
        let stored = match fs::read(&path) {
            Ok(bytes) => decode_stored_state(&bytes).map_err(|err| StateError::Corrupted {
                reason: format!("{}: {err}", path.display()),
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StateError::io(&path, err)),
        };
        if stored.state.tile != tile || stored.fingerprint != *fingerprint {
            return Err(StateError::Corrupted {
                reason: format!(
                    "{} holds tile {} with fingerprint {}",
                    path.display(),
                    stored.state.tile,
                    stored.fingerprint.short()
                ),
            });
        }
        Ok(Some(stored))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| StateError::io(parent, err))?;
    let mut temp = NamedTempFile::new_in(parent).map_err(|err| StateError::io(path, err))?;
    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|err| StateError::io(path, err))?;
    temp.persist(path)
        .map_err(|err| StateError::io(path, err.error))?;
    Ok(())
}

impl StateStore for DiskStateStore {
    fn get(&self, tile: TileId, timestep: u32) -> Result<StoredState, StateError> {
        let head = self
            .head(tile, timestep)?
            .ok_or(StateError::NotFound { tile, timestep })?;
        self.read_state(tile, timestep, &head.fingerprint)?
            .ok_or_else(|| StateError::Corrupted {
                reason: format!(
                    "{} disappeared",
                    self.state_path(tile, timestep, &head.fingerprint).display()
                ),
            })
    }

    fn put(&self, tile: TileId, timestep: u32, state: StoredState) -> Result<(), StateError> {
        let mut heads = self.heads.write().map_err(|_| poisoned())?;
        match heads.get(&(timestep, tile)) {
            Some(head) if head.fingerprint == state.fingerprint => return Ok(()),
            Some(_) => return Err(StateError::Conflict { tile, timestep }),
            None => {}
        }
        let digest = state.state.digest().map_err(StateError::encode)?;
        let path = self.state_path(tile, timestep, &state.fingerprint);
        // Same fingerprint, same content: an earlier run may have written it.
        if !path.is_file() {
            let bytes = encode_stored_state(&state).map_err(StateError::encode)?;
            write_atomic(&path, &bytes)?;
        }
        heads.insert(
            (timestep, tile),
            Head {
                fingerprint: state.fingerprint,
                digest,
            },
        );
        tracing::trace!(
            target: "forage::state",
            %tile,
            timestep,
            fingerprint = %state.fingerprint.short(),
            "state.put"
        );
        Ok(())
    }

    fn contains(&self, tile: TileId, timestep: u32) -> bool {
        matches!(self.head(tile, timestep), Ok(Some(_)))
    }

    fn load(
        &self,
        tile: TileId,
        timestep: u32,
        fingerprint: &Fingerprint,
    ) -> Result<StoredState, StateError> {
        let stored = self
            .read_state(tile, timestep, fingerprint)?
            .ok_or(StateError::NotFound { tile, timestep })?;
        let digest = stored.state.digest().map_err(StateError::encode)?;
        let mut heads = self.heads.write().map_err(|_| poisoned())?;
        match heads.get(&(timestep, tile)) {
            Some(head) if head.fingerprint != *fingerprint => {
                return Err(StateError::Conflict { tile, timestep })
            }
            Some(_) => {}
            None => {
                heads.insert(
                    (timestep, tile),
                    Head {
                        fingerprint: *fingerprint,
                        digest,
                    },
                );
            }
        }
        Ok(stored)
    }

    fn snapshot(&self, timestep: u32) -> Result<CheckpointToken, StateError> {
        let regions: Vec<_> = {
            let heads = self.heads.read().map_err(|_| poisoned())?;
            heads
                .range(timestep_range(timestep))
                .map(|((_, tile), head)| RegionCheckpoint {
                    tile: *tile,
                    fingerprint: head.fingerprint,
                    digest: head.digest,
                })
                .collect()
        };
        if regions.is_empty() {
            return Err(StateError::EmptySnapshot { timestep });
        }
        let token = CheckpointToken::new(timestep, regions).map_err(StateError::encode)?;
        let json = encode_checkpoint_json(&token).map_err(StateError::encode)?;
        write_atomic(&self.manifest_path(timestep), json.as_bytes())?;
        tracing::info!(
            target: "forage::state",
            timestep,
            regions = token.regions.len(),
            "state.checkpoint"
        );
        Ok(token)
    }

    fn checkpoints(&self) -> Result<Vec<CheckpointToken>, StateError> {
        let dir = self.root.join("checkpoints");
        let mut tokens = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|err| StateError::io(&dir, err))? {
            let path = entry.map_err(|err| StateError::io(&dir, err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path).map_err(|err| StateError::io(&path, err))?;
            let token = decode_checkpoint_json(&text).map_err(|err| StateError::Corrupted {
                reason: format!("{}: {err}", path.display()),
            })?;
            tokens.push(token);
        }
        tokens.sort_by_key(|token| token.timestep);
        Ok(tokens)
    }
}
