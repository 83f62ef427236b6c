use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Raw slot persistence. Values are opaque strings; encryption happens above this layer.
pub trait StorageBackend: Send + Sync {
    fn load(&self, slot: &str) -> io::Result<Option<String>>;
    fn save(&self, slot: &str, value: &str) -> io::Result<()>;
    fn delete(&self, slot: &str) -> io::Result<()>;
    /// Whether contents survive a process restart.
    fn is_durable(&self) -> bool;
}

/// Process-memory backend. Clones share the same map.
/// Not durable: everything is lost when the process exits.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    slots: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view of a slot, bypassing decryption.
    pub fn raw(&self, slot: &str) -> Option<String> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).get(slot).cloned()
    }

    /// Writes a raw value, bypassing encryption (seeding legacy data, corrupting slots in tests).
    pub fn put_raw(&self, slot: &str, value: &str) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(slot.to_string(), value.to_string());
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, slot: &str) -> io::Result<Option<String>> {
        Ok(self.raw(slot))
    }

    fn save(&self, slot: &str, value: &str) -> io::Result<()> {
        self.put_raw(slot, value);
        Ok(())
    }

    fn delete(&self, slot: &str) -> io::Result<()> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).remove(slot);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

/// One file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, slot: &str) -> PathBuf {
        let name: String = slot
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.slot"))
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, slot: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(slot)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, slot: &str, value: &str) -> io::Result<()> {
        // Write-then-rename so a crash never leaves a half-written slot.
        let path = self.path_for(slot);
        let tmp = path.with_extension("slot.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)
    }

    fn delete(&self, slot: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(slot)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}
