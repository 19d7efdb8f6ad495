//! Background loader threads.
//!
//! Load requests go in over one crossbeam channel and finished resources
//! come back over another. Workers never talk to the audio thread; the UI
//! side turns outcomes into source-install commands.

use super::{load_processor, AudioBuffer, Processor, ResourceCache, SoundfontBank};
use crate::error::{EngineError, EngineResult};
use crate::project::TrackId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

/// What a decoded audio file is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPurpose {
    Clip,
    BeatRow(String),
    Sampler { base_midi_note: u8 },
}

/// A load request.
#[derive(Debug, Clone)]
pub enum LoadJob {
    Soundfont {
        track: TrackId,
        path: PathBuf,
        bank: u16,
        preset: u16,
    },
    Plugin {
        track: TrackId,
        path: String,
        state: Vec<u8>,
    },
    Audio {
        track: TrackId,
        path: PathBuf,
        purpose: AudioPurpose,
    },
}

impl LoadJob {
    pub fn track(&self) -> &TrackId {
        match self {
            LoadJob::Soundfont { track, .. }
            | LoadJob::Plugin { track, .. }
            | LoadJob::Audio { track, .. } => track,
        }
    }
}

/// A finished load.
pub enum LoadOutcome {
    Soundfont {
        track: TrackId,
        path: PathBuf,
        bank: u16,
        preset: u16,
        result: EngineResult<Arc<SoundfontBank>>,
    },
    Plugin {
        track: TrackId,
        path: String,
        state: Vec<u8>,
        result: EngineResult<Box<dyn Processor>>,
    },
    Audio {
        track: TrackId,
        path: PathBuf,
        purpose: AudioPurpose,
        result: EngineResult<Arc<AudioBuffer>>,
    },
}

impl LoadOutcome {
    pub fn track(&self) -> &TrackId {
        match self {
            LoadOutcome::Soundfont { track, .. }
            | LoadOutcome::Plugin { track, .. }
            | LoadOutcome::Audio { track, .. } => track,
        }
    }

    pub fn is_ok(&self) -> bool {
        match self {
            LoadOutcome::Soundfont { result, .. } => result.is_ok(),
            LoadOutcome::Plugin { result, .. } => result.is_ok(),
            LoadOutcome::Audio { result, .. } => result.is_ok(),
        }
    }
}

/// Settings the workers need to prepare resources for the engine.
#[derive(Debug, Clone, Copy)]
struct Target {
    sample_rate: u32,
    max_block: usize,
}

fn run_job(job: LoadJob, cache: &ResourceCache, target: Target) -> LoadOutcome {
    match job {
        LoadJob::Soundfont {
            track,
            path,
            bank,
            preset,
        } => {
            let result = cache.soundfont(&path);
            LoadOutcome::Soundfont {
                track,
                path,
                bank,
                preset,
                result,
            }
        }
        LoadJob::Plugin { track, path, state } => {
            let result = load_processor(&path, &state, target.sample_rate, target.max_block);
            LoadOutcome::Plugin {
                track,
                path,
                state,
                result,
            }
        }
        LoadJob::Audio {
            track,
            path,
            purpose,
        } => {
            let result = cache.audio(&path, target.sample_rate);
            LoadOutcome::Audio {
                track,
                path,
                purpose,
                result,
            }
        }
    }
}

/// Fixed set of loader threads.
pub struct LoaderPool {
    jobs: Option<Sender<LoadJob>>,
    outcomes: Receiver<LoadOutcome>,
    workers: Vec<JoinHandle<()>>,
    cache: Arc<ResourceCache>,
}

impl LoaderPool {
    /// Starts `threads` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if a thread cannot be spawned.
    pub fn new(
        threads: usize,
        cache: Arc<ResourceCache>,
        sample_rate: u32,
        max_block: usize,
    ) -> EngineResult<Self> {
        let (job_tx, job_rx) = unbounded::<LoadJob>();
        let (out_tx, out_rx) = unbounded::<LoadOutcome>();
        let target = Target {
            sample_rate,
            max_block,
        };

        let mut workers = Vec::new();
        for i in 0..threads.max(1) {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let cache = Arc::clone(&cache);
            let handle = std::thread::Builder::new()
                .name(format!("beatline-loader-{}", i))
                .spawn(move || {
                    for job in job_rx.iter() {
                        tracing::debug!("Loading {:?}", job);
                        let outcome = run_job(job, &cache, target);
                        if out_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| EngineError::Fatal(format!("spawn loader thread: {}", e)))?;
            workers.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            outcomes: out_rx,
            workers,
            cache,
        })
    }

    /// Queues a job.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` if the workers have shut down.
    pub fn submit(&self, job: LoadJob) -> EngineResult<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| EngineError::Fatal("loader pool shut down".into()))?;
        jobs.send(job)
            .map_err(|_| EngineError::Fatal("loader pool shut down".into()))
    }

    /// Receiver of finished loads, usable in `crossbeam_channel::select!`.
    pub fn outcomes(&self) -> &Receiver<LoadOutcome> {
        &self.outcomes
    }

    pub fn try_recv(&self) -> Option<LoadOutcome> {
        self.outcomes.try_recv().ok()
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        // Closing the job channel ends every worker loop.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_plugin_job_round_trip() {
        let pool = LoaderPool::new(2, Arc::new(ResourceCache::new()), 44_100, 512).unwrap();
        let track = TrackId::from("t1");
        pool.submit(LoadJob::Plugin {
            track: track.clone(),
            path: crate::loader::BUILTIN_SIMPLE_SYNTH.to_string(),
            state: vec![1, 2, 3],
        })
        .unwrap();

        let outcome = pool.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.track(), &track);
        match outcome {
            LoadOutcome::Plugin { result, .. } => {
                assert_eq!(result.ok().map(|p| p.get_state()), Some(vec![1, 2, 3]));
            }
            _ => panic!("unexpected outcome"),
        }
    }

    #[test]
    fn test_missing_audio_reports_error() {
        let pool = LoaderPool::new(1, Arc::new(ResourceCache::new()), 44_100, 512).unwrap();
        pool.submit(LoadJob::Audio {
            track: TrackId::from("t2"),
            path: PathBuf::from("/missing/kick.wav"),
            purpose: AudioPurpose::BeatRow("kick".into()),
        })
        .unwrap();
        let outcome = pool.outcomes().recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!outcome.is_ok());
    }
}
