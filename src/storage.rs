// Storage media (EEPROM, floppy, hard disk) backed by an id-keyed store.
//
// A medium only holds its kind and an opaque id. The bytes live in a
// `MediaStore` and are materialized the first time the medium is accessed.

use std::{
    collections::HashMap,
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::Context;
use derivative::Derivative;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FLOPPY_SIDES: u32 = 1;
pub const FLOPPY_TRACKS: u32 = 77;
pub const FLOPPY_SECTORS: u32 = 26;
pub const FLOPPY_SECTOR_SIZE: u32 = 128;

pub const HARD_DISK_TRACKS: u32 = 40;
pub const HARD_DISK_SECTORS: u32 = 1;
pub const HARD_DISK_CAPACITY: u32 = 360 * 1024;

pub type MediumBuffer = Arc<RwLock<Vec<u8>>>;

pub fn read_buffer(buffer: &MediumBuffer) -> RwLockReadGuard<'_, Vec<u8>> {
    buffer.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_buffer(buffer: &MediumBuffer) -> RwLockWriteGuard<'_, Vec<u8>> {
    buffer.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub sides: u32,
    pub tracks: u32,
    pub sectors: u32,
    pub sector_size: u32,
}

impl Geometry {
    pub fn capacity(&self) -> u32 {
        self.sides * self.tracks * self.sectors * self.sector_size
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediumKind {
    Floppy,
    HardDisk,
    Eeprom { size: u32 },
}

impl MediumKind {
    pub fn geometry(&self) -> Geometry {
        match self {
            MediumKind::Floppy => Geometry {
                sides: FLOPPY_SIDES,
                tracks: FLOPPY_TRACKS,
                sectors: FLOPPY_SECTORS,
                sector_size: FLOPPY_SECTOR_SIZE,
            },
            MediumKind::HardDisk => Geometry {
                sides: 1,
                tracks: HARD_DISK_TRACKS,
                sectors: HARD_DISK_SECTORS,
                sector_size: HARD_DISK_CAPACITY / (HARD_DISK_TRACKS * HARD_DISK_SECTORS),
            },
            MediumKind::Eeprom { size } => Geometry {
                sides: 1,
                tracks: 1,
                sectors: 1,
                sector_size: *size,
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.geometry().capacity() as usize
    }
}

impl fmt::Display for MediumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediumKind::Floppy => write!(f, "Floppy"),
            MediumKind::HardDisk => write!(f, "Hard disk"),
            MediumKind::Eeprom { size } => write!(f, "EEPROM ({} bytes)", size),
        }
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MediumId(pub Uuid);

impl MediumId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MediumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Backing store for media contents, keyed by medium id.
///
/// Without a directory the store is purely in memory. With one, unknown ids
/// are looked up as `<dir>/<id>.bin` and `flush` writes everything back.
#[derive(Debug, Default)]
pub struct MediaStore {
    buffers: HashMap<MediumId, MediumBuffer>,
    directory: Option<PathBuf>,
}

impl MediaStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_directory(directory: impl AsRef<Path>) -> anyhow::Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)
            .with_context(|| format!("creating media directory {}", directory.display()))?;

        Ok(Self {
            buffers: HashMap::new(),
            directory: Some(directory),
        })
    }

    fn path_for(&self, id: MediumId) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.bin", id)))
    }

    pub fn contains(&self, id: MediumId) -> bool {
        self.buffers.contains_key(&id)
            || self.path_for(id).map(|p| p.exists()).unwrap_or(false)
    }

    /// Seeds the store with raw contents, e.g. an imported disk image.
    pub fn insert(&mut self, id: MediumId, data: Vec<u8>) -> MediumBuffer {
        let buffer = Arc::new(RwLock::new(data));
        self.buffers.insert(id, buffer.clone());
        buffer
    }

    /// Returns the buffer for `id`, loading it from disk or creating an empty
    /// one on first use.
    pub fn resolve(&mut self, id: MediumId) -> anyhow::Result<MediumBuffer> {
        if let Some(buffer) = self.buffers.get(&id) {
            return Ok(buffer.clone());
        }

        let data = match self.path_for(id) {
            Some(path) if path.exists() => {
                tracing::info!("[MEDIA] Loading {} from {}", id, path.display());
                fs::read(&path).with_context(|| format!("reading medium {}", path.display()))?
            }
            _ => {
                tracing::debug!("[MEDIA] Creating empty backing data for {}", id);
                Vec::new()
            }
        };

        Ok(self.insert(id, data))
    }

    /// Writes every materialized buffer to the store directory. Returns the
    /// number of media written; in-memory stores write nothing.
    pub fn flush(&self) -> anyhow::Result<usize> {
        let Some(directory) = &self.directory else {
            return Ok(0);
        };

        for (id, buffer) in &self.buffers {
            let path = directory.join(format!("{}.bin", id));
            fs::write(&path, read_buffer(buffer).as_slice())
                .with_context(|| format!("writing medium {}", path.display()))?;
        }
        Ok(self.buffers.len())
    }
}

/// A fixed-capacity medium. Serializes as its kind and id only.
#[derive(Derivative, Serialize, Deserialize)]
#[derivative(Debug, Clone, PartialEq)]
pub struct StorageMedium {
    kind: MediumKind,
    id: Option<MediumId>,
    #[serde(skip)]
    #[derivative(Debug = "ignore", PartialEq = "ignore")]
    buffer: Option<MediumBuffer>,
}

impl StorageMedium {
    pub fn new(kind: MediumKind) -> Self {
        Self {
            kind,
            id: None,
            buffer: None,
        }
    }

    pub fn with_id(kind: MediumKind, id: MediumId) -> Self {
        Self {
            kind,
            id: Some(id),
            buffer: None,
        }
    }

    pub fn floppy() -> Self {
        Self::new(MediumKind::Floppy)
    }

    pub fn hard_disk() -> Self {
        Self::new(MediumKind::HardDisk)
    }

    pub fn eeprom(size: u32) -> Self {
        Self::new(MediumKind::Eeprom { size })
    }

    pub fn kind(&self) -> MediumKind {
        self.kind
    }

    /// Identity, if the medium has been materialized (or was restored with one).
    pub fn id(&self) -> Option<MediumId> {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.kind.capacity()
    }

    /// Materializes the medium and returns its buffer.
    ///
    /// The first call assigns an id if needed and resolves it through
    /// `store`; later calls reuse the same buffer. Either way the buffer is
    /// cut or zero-padded to the medium's capacity before it is handed out.
    pub fn data(&mut self, store: &mut MediaStore) -> anyhow::Result<MediumBuffer> {
        let buffer = match &self.buffer {
            Some(buffer) => buffer.clone(),
            None => {
                let id = *self.id.get_or_insert_with(|| {
                    let id = MediumId::new_random();
                    tracing::info!("[MEDIA] Assigned id {} to new {}", id, self.kind);
                    id
                });
                let buffer = store.resolve(id)?;
                self.buffer = Some(buffer.clone());
                buffer
            }
        };

        let capacity = self.capacity();
        {
            let mut data = write_buffer(&buffer);
            if data.len() != capacity {
                tracing::debug!(
                    "[MEDIA] Adjusting {} from {} to {} bytes",
                    self.kind,
                    data.len(),
                    capacity
                );
                data.resize(capacity, 0);
            }
        }

        Ok(buffer)
    }
}

static GLOBAL_STORE: Lazy<Mutex<Option<MediaStore>>> = Lazy::new(|| Mutex::new(None));

/// Installs the process-wide store, returning the previous one.
pub fn init_global(store: MediaStore) -> Option<MediaStore> {
    GLOBAL_STORE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(store)
}

/// Removes the process-wide store, flushing it first.
pub fn shutdown_global() -> anyhow::Result<Option<MediaStore>> {
    let store = GLOBAL_STORE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(store) = &store {
        store.flush()?;
    }
    Ok(store)
}

/// Runs `f` against the process-wide store, or returns `None` when none is
/// installed.
pub fn with_global<R>(f: impl FnOnce(&mut MediaStore) -> R) -> Option<R> {
    GLOBAL_STORE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_mut()
        .map(f)
}
