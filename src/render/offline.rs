//! Offline (faster than realtime) rendering.
//!
//! The same [`Engine`] the audio callback uses, driven block by block from
//! beat 0 to the end of the last region plus a tail. No loop, no command
//! ring, no device: the output is a pure function of the snapshot, the
//! sources and the sample rate, and does not depend on the block size.

use super::wav::{Wav24Writer, BITS_PER_SAMPLE};
use crate::config::EngineConfig;
use crate::control::Command;
use crate::engine::{Engine, ProjectSnapshot};
use crate::error::{EngineError, EngineResult};
use crate::source::VoiceSource;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Render settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Seconds rendered after the last region for release tails.
    pub tail_seconds: f64,
    pub bit_depth: u16,
}

impl RenderOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            block_size: config.block_size,
            tail_seconds: config.render_tail_seconds,
            bit_depth: BITS_PER_SAMPLE,
        }
    }
}

/// Everything one render needs: a snapshot and a fresh source per slot.
pub struct RenderJob {
    pub snapshot: ProjectSnapshot,
    pub sources: Vec<(usize, Box<dyn VoiceSource>)>,
}

impl RenderJob {
    /// Frames the render produces at `options`.
    pub fn total_frames(&self, options: &RenderOptions) -> u64 {
        let end = self.snapshot.end_sample(options.sample_rate);
        if end == 0 {
            return 0;
        }
        end + (options.tail_seconds.max(0.0) * options.sample_rate as f64).round() as u64
    }
}

/// Runs a render, handing every finished block to `sink`.
///
/// # Arguments
///
/// * `job` - Snapshot and sources; the loop region is ignored
/// * `options` - Rate, block size and tail
/// * `cancel` - Sampled at every block boundary
/// * `progress` - Called after each block with the finished fraction
/// * `sink` - Receives planar output blocks in order
///
/// # Returns
///
/// The number of frames rendered
///
/// # Errors
///
/// Returns `InvalidArgument` for an empty project, `Cancelled` when the
/// flag is raised, and whatever `sink` returns.
pub fn render_blocks<P, S>(
    job: RenderJob,
    options: &RenderOptions,
    cancel: &AtomicBool,
    mut progress: P,
    mut sink: S,
) -> EngineResult<u64>
where
    P: FnMut(f32),
    S: FnMut(&[f32], &[f32]) -> EngineResult<()>,
{
    let total = job.total_frames(options);
    if total == 0 {
        return Err(EngineError::InvalidArgument("nothing to render".into()));
    }
    let block = options.block_size.max(1);
    let slot_count = job
        .sources
        .iter()
        .map(|(slot, _)| slot + 1)
        .chain(job.snapshot.tracks.iter().map(|t| t.slot + 1))
        .max()
        .unwrap_or(1);

    let mut engine = Engine::new(options.sample_rate, block, slot_count);
    for (slot, mut source) in job.sources {
        source.prepare(options.sample_rate, block);
        engine.apply(Command::InstallSource { slot, source });
    }
    let mut snapshot = job.snapshot;
    snapshot.loop_region = None;
    engine.apply(Command::UpdateSnapshot(Box::new(snapshot)));
    engine.apply(Command::TransportStart(Some(0.0)));

    tracing::info!(
        "Offline render: {} frames at {} Hz, block {}",
        total,
        options.sample_rate,
        block
    );
    let mut left = vec![0.0f32; block];
    let mut right = vec![0.0f32; block];
    let mut done = 0u64;
    while done < total {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!("Offline render cancelled at frame {}", done);
            return Err(EngineError::Cancelled);
        }
        let n = (total - done).min(block as u64) as usize;
        engine.process_block(&mut left[..n], &mut right[..n]);
        sink(&left[..n], &right[..n])?;
        done += n as u64;
        progress(done as f32 / total as f32);
    }
    Ok(done)
}

/// Renders a job to planar buffers.
pub fn render_to_buffers(
    job: RenderJob,
    options: &RenderOptions,
) -> EngineResult<(Vec<f32>, Vec<f32>)> {
    let frames = job.total_frames(options) as usize;
    let mut left = Vec::with_capacity(frames);
    let mut right = Vec::with_capacity(frames);
    let never = AtomicBool::new(false);
    render_blocks(job, options, &never, |_| {}, |l, r| {
        left.extend_from_slice(l);
        right.extend_from_slice(r);
        Ok(())
    })?;
    Ok((left, right))
}

/// Renders a job to a 24-bit stereo WAV file.
///
/// A cancelled render leaves a valid, truncated file behind.
///
/// # Arguments
///
/// * `job` - Snapshot and sources to render
/// * `output_path` - Destination file
/// * `options` - Rate, block size, tail and bit depth
/// * `cancel` - Stop flag, checked between blocks
/// * `progress_callback` - Optional progress updates (0.0 to 1.0)
///
/// # Returns
///
/// The number of frames written
///
/// # Errors
///
/// Returns an error if:
/// - The bit depth is not 24 (`Unsupported`)
/// - The project is empty (`InvalidArgument`)
/// - The output file cannot be created or written
/// - The cancel flag was raised (`Cancelled`)
pub fn export_wav<P, F>(
    job: RenderJob,
    output_path: P,
    options: &RenderOptions,
    cancel: &AtomicBool,
    mut progress_callback: Option<F>,
) -> Result<u64>
where
    P: AsRef<Path>,
    F: FnMut(f32),
{
    let output_path = output_path.as_ref();
    if options.bit_depth != BITS_PER_SAMPLE {
        return Err(EngineError::Unsupported(format!(
            "{}-bit output (only 24-bit is written)",
            options.bit_depth
        ))
        .into());
    }
    if job.total_frames(options) == 0 {
        return Err(EngineError::InvalidArgument("nothing to render".into()).into());
    }

    let file = File::create(output_path).with_context(|| {
        format!("Failed to create output WAV file: {}", output_path.display())
    })?;
    let mut writer = Wav24Writer::new(BufWriter::new(file), options.sample_rate)?;

    let rendered = render_blocks(
        job,
        options,
        cancel,
        |p| {
            if let Some(callback) = progress_callback.as_mut() {
                callback(p);
            }
        },
        |l, r| writer.write_block(l, r),
    );
    // Close the file on every path so a cancelled render stays readable.
    let finished = writer.finish();
    let frames = rendered?;
    finished
        .map(drop)
        .with_context(|| format!("Failed to finalize WAV file: {}", output_path.display()))?;
    tracing::info!("Rendered {} frames to {}", frames, output_path.display());
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::test_support::sine_bank;
    use crate::loader::{load_processor, BUILTIN_SIMPLE_SYNTH};
    use crate::project::{
        AutomationCurve, AutomationPoint, InstrumentBinding, Note, ParamKind, Project, Track, TrackId,
    };
    use crate::render::wav::decode_wav;
    use crate::source::{PluginSource, SoundfontSource};
    use std::collections::HashMap;
    use std::sync::Arc;

    const SR: u32 = 44_100;

    fn options(block_size: usize) -> RenderOptions {
        RenderOptions {
            sample_rate: SR,
            block_size,
            tail_seconds: 2.0,
            bit_depth: 24,
        }
    }

    fn single_note_project() -> Project {
        let mut project = Project::new();
        let mut track = Track::new_midi("piano");
        track
            .bind_instrument(InstrumentBinding::Soundfont {
                path: "sine.sf2".into(),
                bank: 0,
                preset: 0,
            })
            .unwrap();
        track.add_note(Note::new(60, 0.0, 1.0, 0.8)).unwrap();
        project.add_track(track).unwrap();
        project
    }

    fn snapshot(project: &Project) -> ProjectSnapshot {
        let slots: HashMap<TrackId, usize> = project
            .tracks()
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        ProjectSnapshot::build(project, &slots, SR, 1).unwrap()
    }

    fn soundfont_job(project: &Project) -> RenderJob {
        let bank = Arc::new(sine_bank(SR));
        let sources = (0..project.track_count())
            .map(|slot| {
                let (src, _) = SoundfontSource::new(Arc::clone(&bank), 0, 0);
                (slot, Box::new(src) as Box<dyn VoiceSource>)
            })
            .collect();
        RenderJob {
            snapshot: snapshot(project),
            sources,
        }
    }

    fn peak(buf: &[f32]) -> f32 {
        buf.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn test_single_note_render_shape() {
        let project = single_note_project();
        let (left, right) = render_to_buffers(soundfont_job(&project), &options(512)).unwrap();
        assert_eq!(left.len(), 176_400);
        assert_eq!(right.len(), 176_400);

        // 2 ms at 44.1 kHz is 88 frames; the attack is 1 ms.
        let head = peak(&left[..88]);
        assert!(head > 0.1, "head peak {}", head);
        assert!(peak(&left[..22_050]) > 0.1);

        let tail = peak(&left[88_200..]).max(peak(&right[88_200..]));
        assert!(tail < 0.001, "tail peak {}", tail);
    }

    #[test]
    fn test_block_size_does_not_change_output() {
        let mut project = single_note_project();
        let mut second = Track::new_midi("pad");
        second
            .bind_instrument(InstrumentBinding::Soundfont {
                path: "sine.sf2".into(),
                bank: 0,
                preset: 0,
            })
            .unwrap();
        second.add_note(Note::new(64, 0.37, 2.2, 0.6)).unwrap();
        second.add_note(Note::new(67, 1.01, 0.5, 1.0)).unwrap();
        second.automation.set_lane(
            ParamKind::Pan,
            Some(
                AutomationCurve::new(vec![
                    AutomationPoint { beat: 0.0, value: 0.0 },
                    AutomationPoint { beat: 3.0, value: 1.0 },
                ])
                .unwrap(),
            ),
        );
        project.add_track(second).unwrap();

        let (l64, r64) = render_to_buffers(soundfont_job(&project), &options(64)).unwrap();
        let (l512, r512) = render_to_buffers(soundfont_job(&project), &options(512)).unwrap();
        let (l1024, r1024) = render_to_buffers(soundfont_job(&project), &options(1024)).unwrap();
        assert!(l64 == l512 && l512 == l1024);
        assert!(r64 == r512 && r512 == r1024);
    }

    #[test]
    fn test_two_renders_identical() {
        let project = single_note_project();
        let a = render_to_buffers(soundfont_job(&project), &options(256)).unwrap();
        let b = render_to_buffers(soundfont_job(&project), &options(256)).unwrap();
        assert!(a == b);
    }

    #[test]
    fn test_empty_project_rejected() {
        let project = Project::new();
        let err = render_to_buffers(soundfont_job(&project), &options(512)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_export_writes_wav_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.wav");
        let project = single_note_project();
        let cancel = AtomicBool::new(false);
        let mut last = 0.0;
        let frames = export_wav(
            soundfont_job(&project),
            &path,
            &options(4096),
            &cancel,
            Some(|p: f32| last = p),
        )
        .unwrap();
        assert_eq!(frames, 176_400);
        assert_eq!(last, 1.0);

        let wav = decode_wav(File::open(&path).unwrap()).unwrap();
        assert_eq!(wav.sample_rate, SR);
        assert_eq!(wav.frames(), 176_400);
    }

    #[test]
    fn test_cancelled_export_leaves_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.wav");
        let project = single_note_project();
        let cancel = AtomicBool::new(false);
        let err = export_wav(
            soundfont_job(&project),
            &path,
            &options(1000),
            &cancel,
            Some(|p: f32| {
                if p > 0.1 {
                    cancel.store(true, Ordering::Relaxed);
                }
            }),
        )
        .unwrap_err();
        let kind = err.downcast_ref::<EngineError>().map(|e| e.kind());
        assert_eq!(kind, Some(crate::error::ErrorKind::Cancelled));

        let wav = decode_wav(File::open(&path).unwrap()).unwrap();
        assert!(wav.frames() > 0 && wav.frames() < 176_400);
        assert_eq!(wav.frames() % 1000, 0);
    }

    #[test]
    fn test_sixteen_bit_export_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let project = single_note_project();
        let mut opts = options(512);
        opts.bit_depth = 16;
        let err = export_wav(
            soundfont_job(&project),
            dir.path().join("x.wav"),
            &opts,
            &AtomicBool::new(false),
            None::<fn(f32)>,
        )
        .unwrap_err();
        let kind = err.downcast_ref::<EngineError>().map(|e| e.kind());
        assert_eq!(kind, Some(crate::error::ErrorKind::Unsupported));
    }

    #[test]
    fn test_plugin_state_blob_renders_identically() {
        let blob: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut project = Project::new();
        let mut lead = Track::new_midi("lead");
        lead.bind_instrument(InstrumentBinding::Plugin {
            path: BUILTIN_SIMPLE_SYNTH.into(),
            preset: blob.clone(),
        })
        .unwrap();
        lead.add_note(Note::new(57, 0.0, 1.5, 0.9)).unwrap();
        lead.add_note(Note::new(64, 1.0, 1.0, 0.7)).unwrap();
        project.add_track(lead).unwrap();

        let json = crate::project::project_to_json(&project).unwrap();
        let reloaded = crate::project::project_from_json(&json).unwrap();
        let stored = match reloaded.tracks()[0].instrument() {
            Some(InstrumentBinding::Plugin { preset, .. }) => preset.clone(),
            other => panic!("unexpected binding {:?}", other),
        };
        assert_eq!(stored, blob);

        let job = |p: &Project, state: &[u8]| {
            let processor = load_processor(BUILTIN_SIMPLE_SYNTH, state, SR, 512).unwrap();
            RenderJob {
                snapshot: snapshot(p),
                sources: vec![(0, Box::new(PluginSource::new(processor)) as Box<dyn VoiceSource>)],
            }
        };
        let original = render_to_buffers(job(&project, &blob), &options(512)).unwrap();
        let restored = render_to_buffers(job(&reloaded, &stored), &options(512)).unwrap();
        assert!(peak(&original.0) > 0.0);
        assert!(original == restored);
    }
}
