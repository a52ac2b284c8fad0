//! Content-addressed artifact storage keyed by fingerprint.
//!
//! Entries live in memory and, when a directory is configured, on disk as
//! `<dir>/<first two hex digits>/<fingerprint>.art`. Disk entries carry a
//! payload digest; a mismatch on read is reported as corruption and never
//! silently served.
//!
//! Memory residency is generational: every insert or lookup tags the entry
//! with the current generation, and [`ArtifactCache::evict_older_than`] drops
//! whatever was not touched since. Disk entries are unaffected.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use ahash::AHashMap;
use forage_proto::{content_digest, Fingerprint};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("artifact cache I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode artifact {fingerprint}: {reason}")]
    Encode {
        fingerprint: Fingerprint,
        reason: String,
    },
    #[error("cached artifact {fingerprint} is corrupted: {reason}")]
    Corruption {
        fingerprint: Fingerprint,
        reason: String,
    },
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    fingerprint: Fingerprint,
    digest: u64,
    payload: Vec<u8>,
}

struct Resident<A> {
    artifact: Arc<A>,
    generation: u64,
}

pub struct ArtifactCache<A> {
    memory: RwLock<AHashMap<Fingerprint, Resident<A>>>,
    generation: AtomicU64,
    dir: Option<PathBuf>,
}

impl<A> std::fmt::Debug for ArtifactCache<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("dir", &self.dir)
            .field("entries", &self.memory.read().map(|m| m.len()).unwrap_or(0))
            .finish()
    }
}

impl<A> ArtifactCache<A>
where
    A: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn in_memory() -> Self {
        Self {
            memory: RwLock::new(AHashMap::new()),
            generation: AtomicU64::new(0),
            dir: None,
        }
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            memory: RwLock::new(AHashMap::new()),
            generation: AtomicU64::new(0),
            dir: Some(dir),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Starts a new residency generation and returns its number.
    pub fn begin_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops in-memory entries last touched before `generation`. Returns how
    /// many were dropped.
    pub fn evict_older_than(&self, generation: u64) -> usize {
        let Ok(mut memory) = self.memory.write() else {
            return 0;
        };
        let before = memory.len();
        memory.retain(|_, resident| resident.generation >= generation);
        before - memory.len()
    }

    fn remember(
        memory: &mut AHashMap<Fingerprint, Resident<A>>,
        fingerprint: Fingerprint,
        artifact: Arc<A>,
        generation: u64,
    ) -> Arc<A> {
        let resident = memory.entry(fingerprint).or_insert(Resident { artifact, generation });
        resident.generation = resident.generation.max(generation);
        resident.artifact.clone()
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let hex = fingerprint.to_hex();
        self.dir
            .as_ref()
            .map(|dir| dir.join(&hex[..2]).join(format!("{hex}.art")))
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let in_memory = self
            .memory
            .read()
            .map(|memory| memory.contains_key(fingerprint))
            .unwrap_or(false);
        in_memory
            || self
                .entry_path(fingerprint)
                .is_some_and(|path| path.is_file())
    }

    /// Looks up an artifact, promoting verified disk entries into memory.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Arc<A>>, CacheError> {
        let generation = self.generation();
        if let Some(found) = self.memory.write().ok().and_then(|mut memory| {
            memory.get_mut(fingerprint).map(|resident| {
                resident.generation = resident.generation.max(generation);
                resident.artifact.clone()
            })
        }) {
            return Ok(Some(found));
        }
        let Some(path) = self.entry_path(fingerprint) else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let corruption = |reason: String| CacheError::Corruption {
            fingerprint: *fingerprint,
            reason,
        };
        let entry: CacheEntry =
            bincode::deserialize(&bytes).map_err(|err| corruption(format!("undecodable entry: {err}")))?;
        if entry.fingerprint != *fingerprint {
            return Err(corruption(format!("entry names {}", entry.fingerprint)));
        }
        if content_digest(&entry.payload) != entry.digest {
            return Err(corruption("payload digest mismatch".to_string()));
        }
        let artifact: A = bincode::deserialize(&entry.payload)
            .map_err(|err| corruption(format!("undecodable payload: {err}")))?;
        let artifact = Arc::new(artifact);
        if let Ok(mut memory) = self.memory.write() {
            return Ok(Some(Self::remember(&mut memory, *fingerprint, artifact, generation)));
        }
        Ok(Some(artifact))
    }

    fn write_disk(&self, fingerprint: &Fingerprint, artifact: &A) -> Result<(), CacheError> {
        let Some(path) = self.entry_path(fingerprint) else {
            return Ok(());
        };
        if path.is_file() {
            return Ok(());
        }
        let encode = |err: bincode::Error| CacheError::Encode {
            fingerprint: *fingerprint,
            reason: err.to_string(),
        };
        let payload = bincode::serialize(artifact).map_err(encode)?;
        let entry = CacheEntry {
            fingerprint: *fingerprint,
            digest: content_digest(&payload),
            payload,
        };
        let bytes = bincode::serialize(&entry).map_err(encode)?;
        let io_err = |source| CacheError::Io {
            path: path.clone(),
            source,
        };
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;
        let mut temp = NamedTempFile::new_in(parent).map_err(io_err)?;
        temp.write_all(&bytes).map_err(io_err)?;
        // A concurrent writer may have won; identical content either way.
        match temp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(io_err(err.error)),
        }
    }

    /// Inserts unless an entry already exists; the first writer wins.
    pub fn insert_if_absent(&self, fingerprint: Fingerprint, artifact: Arc<A>) -> Result<Arc<A>, CacheError> {
        self.write_disk(&fingerprint, &artifact)?;
        let mut memory = self.memory.write().map_err(|_| CacheError::Corruption {
            fingerprint,
            reason: "cache lock poisoned".to_string(),
        })?;
        Ok(Self::remember(&mut memory, fingerprint, artifact, self.generation()))
    }

    /// Memory-only insert for artifacts that are cheap to recreate.
    pub fn insert_transient(&self, fingerprint: Fingerprint, artifact: Arc<A>) {
        if let Ok(mut memory) = self.memory.write() {
            Self::remember(&mut memory, fingerprint, artifact, self.generation());
        }
    }

    /// Registers a node's outputs together: everything is persisted before any
    /// of it becomes visible in memory.
    pub fn insert_all(&self, outputs: Vec<(Fingerprint, Arc<A>)>) -> Result<(), CacheError> {
        for (fingerprint, artifact) in &outputs {
            self.write_disk(fingerprint, artifact)?;
        }
        let Ok(mut memory) = self.memory.write() else {
            return Err(CacheError::Corruption {
                fingerprint: outputs.first().map(|(fp, _)| *fp).unwrap_or(Fingerprint::from_bytes([0; 32])),
                reason: "cache lock poisoned".to_string(),
            });
        };
        let generation = self.generation();
        for (fingerprint, artifact) in outputs {
            Self::remember(&mut memory, fingerprint, artifact, generation);
        }
        Ok(())
    }

    /// Number of artifacts held in memory.
    pub fn memory_len(&self) -> usize {
        self.memory.read().map(|memory| memory.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let cache = ArtifactCache::<Vec<f64>>::in_memory();
        let fp = Fingerprint::of_bytes(b"k");
        let first = cache.insert_if_absent(fp, Arc::new(vec![1.0])).expect("insert");
        let second = cache.insert_if_absent(fp, Arc::new(vec![2.0])).expect("insert");
        assert_eq!(*first, vec![1.0]);
        assert_eq!(*second, vec![1.0]);
        assert_eq!(cache.memory_len(), 1);
    }

    #[test]
    fn disk_entries_survive_a_new_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fp = Fingerprint::of_bytes(b"forcing");
        {
            let cache = ArtifactCache::<Vec<f64>>::open(dir.path()).expect("open");
            cache
                .insert_all(vec![(fp, Arc::new(vec![0.5, 1.5]))])
                .expect("insert");
        }
        let cache = ArtifactCache::<Vec<f64>>::open(dir.path()).expect("reopen");
        assert_eq!(cache.memory_len(), 0);
        assert!(cache.contains(&fp));
        assert_eq!(*cache.get(&fp).expect("get").expect("present"), vec![0.5, 1.5]);
        assert_eq!(cache.memory_len(), 1);
    }

    #[test]
    fn tampered_entry_is_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fp = Fingerprint::of_bytes(b"state");
        ArtifactCache::<Vec<f64>>::open(dir.path())
            .and_then(|cache| cache.insert_if_absent(fp, Arc::new(vec![3.0; 4])).map(|_| ()))
            .expect("insert");

        let cache = ArtifactCache::<Vec<f64>>::open(dir.path()).expect("reopen");
        let path = cache.entry_path(&fp).expect("disk path");
        let mut bytes = fs::read(&path).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        fs::write(&path, &bytes).expect("tamper");
        assert!(matches!(cache.get(&fp), Err(CacheError::Corruption { .. })));
    }

    #[test]
    fn eviction_keeps_recently_touched_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArtifactCache::<Vec<f64>>::open(dir.path()).expect("open");
        let old = Fingerprint::of_bytes(b"old");
        let reused = Fingerprint::of_bytes(b"reused");
        cache.insert_if_absent(old, Arc::new(vec![1.0])).expect("insert");
        cache.insert_transient(reused, Arc::new(vec![2.0]));

        let next = cache.begin_generation();
        cache.get(&reused).expect("get").expect("present");
        assert_eq!(cache.evict_older_than(next), 1);
        assert_eq!(cache.memory_len(), 1);

        // Evicted entries are still served from disk.
        assert_eq!(*cache.get(&old).expect("get").expect("on disk"), vec![1.0]);
        assert_eq!(cache.memory_len(), 2);
    }

    #[test]
    fn missing_entry_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ArtifactCache::<Vec<f64>>::open(dir.path()).expect("open");
        assert!(cache.get(&Fingerprint::of_bytes(b"absent")).expect("get").is_none());
    }
}
