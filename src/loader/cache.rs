//! Reference-counted resource cache.
//!
//! The cache holds only weak references: a decoded file stays alive while
//! some track (or snapshot) holds its `Arc`, and is freed when the last
//! holder drops it. The lock is taken on the UI and loader threads only.

use super::{decode_audio_file, load_soundfont, AudioBuffer, SoundfontBank};
use crate::error::EngineResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Identity of a cached resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A decoded audio file at a given engine rate.
    Audio { path: PathBuf, sample_rate: u32 },
    Soundfont(PathBuf),
}

#[derive(Default)]
pub struct ResourceCache {
    audio: RwLock<HashMap<CacheKey, Weak<AudioBuffer>>>,
    soundfonts: RwLock<HashMap<CacheKey, Weak<SoundfontBank>>>,
}

/// Looks up `key`, or runs `load` and remembers the result.
fn get_or_insert<T>(
    map: &RwLock<HashMap<CacheKey, Weak<T>>>,
    key: CacheKey,
    load: impl FnOnce() -> EngineResult<T>,
) -> EngineResult<Arc<T>> {
    if let Some(hit) = map.read().get(&key).and_then(Weak::upgrade) {
        tracing::debug!("Cache hit for {:?}", key);
        return Ok(hit);
    }
    // Decode without holding the lock; a racing load of the same key
    // simply wins or loses the insert below.
    let loaded = Arc::new(load()?);
    let mut guard = map.write();
    if let Some(existing) = guard.get(&key).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    guard.insert(key, Arc::downgrade(&loaded));
    Ok(loaded)
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded audio for `path` at `sample_rate`, shared with other holders.
    pub fn audio(&self, path: &Path, sample_rate: u32) -> EngineResult<Arc<AudioBuffer>> {
        let key = CacheKey::Audio {
            path: path.to_path_buf(),
            sample_rate,
        };
        get_or_insert(&self.audio, key, || decode_audio_file(path, sample_rate))
    }

    /// Parsed soundfont for `path`, shared with other holders.
    pub fn soundfont(&self, path: &Path) -> EngineResult<Arc<SoundfontBank>> {
        let key = CacheKey::Soundfont(path.to_path_buf());
        get_or_insert(&self.soundfonts, key, || load_soundfont(path))
    }

    /// Registers an already decoded buffer under `path`.
    pub fn insert_audio(&self, path: &Path, buffer: AudioBuffer) -> Arc<AudioBuffer> {
        let key = CacheKey::Audio {
            path: path.to_path_buf(),
            sample_rate: buffer.sample_rate(),
        };
        let arc = Arc::new(buffer);
        self.audio.write().insert(key, Arc::downgrade(&arc));
        arc
    }

    /// Number of resources still alive.
    pub fn live_count(&self) -> usize {
        let audio = self.audio.read().values().filter(|w| w.strong_count() > 0).count();
        let sf = self
            .soundfonts
            .read()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count();
        audio + sf
    }

    /// Forgets entries whose last holder has gone.
    pub fn purge(&self) -> usize {
        let mut removed = 0;
        {
            let mut audio = self.audio.write();
            let before = audio.len();
            audio.retain(|_, w| w.strong_count() > 0);
            removed += before - audio.len();
        }
        let mut sf = self.soundfonts.write();
        let before = sf.len();
        sf.retain(|_, w| w.strong_count() > 0);
        removed + before - sf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..441 {
            writer.write_sample((i * 50) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_shared_until_last_holder_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        write_tone(&path);

        let cache = ResourceCache::new();
        let a = cache.audio(&path, 44_100).unwrap();
        let b = cache.audio(&path, 44_100).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.live_count(), 1);

        drop(a);
        drop(b);
        assert_eq!(cache.live_count(), 0);
        assert_eq!(cache.purge(), 1);
    }

    #[test]
    fn test_rate_is_part_of_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        write_tone(&path);

        let cache = ResourceCache::new();
        let a = cache.audio(&path, 44_100).unwrap();
        let b = cache.audio(&path, 48_000).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(b.sample_rate(), 48_000);
    }

    #[test]
    fn test_failed_load_not_cached() {
        let cache = ResourceCache::new();
        assert!(cache.audio(Path::new("/missing.wav"), 44_100).is_err());
        assert_eq!(cache.purge(), 0);
    }
}
