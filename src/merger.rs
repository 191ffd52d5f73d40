//! Stage 8: deterministic segment-placement and time-stretching logic
//! that stitches cloned audio and optional accompaniment into the final
//! voice track (spec §4.6).

use crate::config::MergerConfig;
use crate::engines::muxer::time_stretch;
use crate::error::{DubError, Result};
use crate::segment::Segment;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use tracing::warn;

const LEVEL_MATCH_CAP_DB: f64 = 3.0;

/// Decides how a clone longer than its segment's budget should be
/// shortened: compress by the minimum factor that fits (capped at
/// `max_stretch`), then truncate anything still left over (spec §4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClonePlan {
    pub stretch_factor: Option<f64>,
    pub truncate_to_samples: Option<usize>,
}

pub fn plan_clone_fit(
    original_duration_s: f64,
    actual_duration_s: f64,
    max_stretch: f64,
    sample_rate: u32,
) -> ClonePlan {
    if original_duration_s <= 0.0 || actual_duration_s <= original_duration_s * max_stretch {
        return ClonePlan {
            stretch_factor: None,
            truncate_to_samples: None,
        };
    }

    let required_factor = actual_duration_s / original_duration_s;
    let applied_factor = required_factor.min(max_stretch);
    let stretched_duration = actual_duration_s / applied_factor;

    let truncate = if stretched_duration > original_duration_s {
        Some((original_duration_s * sample_rate as f64).round() as usize)
    } else {
        None
    };

    ClonePlan {
        stretch_factor: Some(applied_factor),
        truncate_to_samples: truncate,
    }
}

/// A segment's placement on the output track, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub segment_id: usize,
    pub start: usize,
    pub end: usize,
}

/// Overlap repair (spec §4.6 step 4): if a placement begins before the
/// previous one ends, shift it forward by the overlap; if this pushes
/// its end past `total_samples`, truncate it. Segments must already be
/// sorted by `start`.
pub fn resolve_overlaps(mut placements: Vec<Placement>, total_samples: usize) -> Vec<Placement> {
    let mut previous_end = 0usize;
    for placement in placements.iter_mut() {
        if placement.start < previous_end {
            let overlap = previous_end - placement.start;
            let len = placement.end.saturating_sub(placement.start);
            placement.start = previous_end;
            placement.end = (placement.start + len.saturating_sub(overlap)).max(placement.start);
        }
        if placement.end > total_samples {
            placement.end = total_samples;
        }
        if placement.start > total_samples {
            placement.start = total_samples;
            placement.end = total_samples;
        }
        previous_end = placement.end;
    }
    placements
}

pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

/// Linear gain that would move `clone_rms` to `original_rms`, clamped to
/// `±cap_db` (spec §4.6 step 5; the ±3 dB cap is an Open Question
/// resolved in DESIGN.md).
pub fn level_match_gain(original_rms: f64, clone_rms: f64, cap_db: f64) -> f64 {
    if clone_rms <= 0.0 || original_rms <= 0.0 {
        return 1.0;
    }
    let ideal_gain = original_rms / clone_rms;
    let ideal_db = 20.0 * ideal_gain.log10();
    let clamped_db = ideal_db.clamp(-cap_db, cap_db);
    10f64.powf(clamped_db / 20.0)
}

fn apply_gain(samples: &[i16], gain: f64) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let scaled = (s as f64) * gain;
            scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

fn db_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

fn read_samples(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| DubError::EngineFailure(format!("failed to open wav {}: {e}", path.display())))?;
    let spec = reader.spec();
    let samples: std::result::Result<Vec<i16>, _> = match spec.sample_format {
        SampleFormat::Int => reader.samples::<i16>().collect(),
        SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v * i16::MAX as f32) as i16))
            .collect(),
    };
    let samples = samples.map_err(|e| DubError::EngineFailure(format!("failed to read wav samples: {e}")))?;
    Ok((samples, spec.sample_rate))
}

fn write_samples(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = WavWriter::create(path, spec)
        .map_err(|e| DubError::EngineFailure(format!("failed to create wav {}: {e}", path.display())))?;
    for &s in samples {
        writer
            .write_sample(s)
            .map_err(|e| DubError::EngineFailure(format!("failed to write wav sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| DubError::EngineFailure(format!("failed to finalize wav: {e}")))?;
    Ok(())
}

pub struct Merger<'a> {
    config: &'a MergerConfig,
}

impl<'a> Merger<'a> {
    pub fn new(config: &'a MergerConfig) -> Self {
        Self { config }
    }

    /// Builds `08_final_voice.wav` (spec §4.6). `total_duration_s` is the
    /// original media's duration; `clone_path` resolves a segment id to
    /// its clone file, when one exists (a missing clone substitutes
    /// silence, per the per-segment-failure propagation policy, §7).
    /// Returns any warnings raised while fitting clones to their budget
    /// or substituting silence for a missing clone.
    pub fn merge(
        &self,
        segments: &[Segment],
        vocals_path: &Path,
        accompaniment_path: Option<&Path>,
        clone_path: impl Fn(usize) -> Option<std::path::PathBuf>,
        dest: &Path,
        total_duration_s: f64,
    ) -> Result<Vec<String>> {
        let (vocals_samples, sample_rate) = read_samples(vocals_path)?;
        let total_samples = (total_duration_s * sample_rate as f64).round() as usize;
        let mut warnings = Vec::new();

        let mut sorted: Vec<&Segment> = segments.iter().collect();
        sorted.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap());

        let mut leveled_by_segment: Vec<(usize, Vec<i16>)> = Vec::new();
        let mut placements = Vec::new();

        for seg in &sorted {
            let Some(path) = clone_path(seg.id) else {
                warnings.push(format!("segment {} has no clone; substituting silence", seg.id));
                continue;
            };

            let original_duration = seg.original_duration();
            let (clone_samples, clone_rate) = read_samples(&path)?;
            let actual_duration = clone_samples.len() as f64 / clone_rate as f64;
            let plan = plan_clone_fit(original_duration, actual_duration, self.config.max_stretch, sample_rate);

            let fitted = if let Some(factor) = plan.stretch_factor {
                let stretched_path = path.with_file_name(format!(
                    "{}.stretched.wav",
                    path.file_stem().and_then(|s| s.to_str()).unwrap_or("segment")
                ));
                time_stretch(&path, &stretched_path, factor)?;
                let (mut stretched, _) = read_samples(&stretched_path)?;
                let _ = std::fs::remove_file(&stretched_path);
                if let Some(limit) = plan.truncate_to_samples {
                    stretched.truncate(limit);
                    warnings.push(format!(
                        "segment {}: clone compressed by factor {:.2} and truncated to fit",
                        seg.id, factor
                    ));
                } else {
                    warnings.push(format!("segment {}: clone compressed by factor {:.2}", seg.id, factor));
                }
                stretched
            } else {
                clone_samples
            };

            let window_start = (seg.start * sample_rate as f64).round() as usize;
            let window_end = ((seg.end * sample_rate as f64).round() as usize).min(vocals_samples.len());
            let window = vocals_samples
                .get(window_start.min(vocals_samples.len())..window_end)
                .unwrap_or(&[]);
            let gain = level_match_gain(rms(window), rms(&fitted), LEVEL_MATCH_CAP_DB);
            let leveled = apply_gain(&fitted, gain);

            placements.push(Placement {
                segment_id: seg.id,
                start: window_start,
                end: window_start + leveled.len(),
            });
            leveled_by_segment.push((seg.id, leveled));
        }

        let placements = resolve_overlaps(placements, total_samples);

        let mut track = vec![0i16; total_samples];
        for placement in &placements {
            let Some((_, samples)) = leveled_by_segment.iter().find(|(id, _)| *id == placement.segment_id)
            else {
                continue;
            };
            let len = (placement.end - placement.start).min(samples.len());
            track[placement.start..placement.start + len].copy_from_slice(&samples[..len]);
        }

        if let Some(accompaniment_path) = accompaniment_path {
            let (accompaniment, _) = read_samples(accompaniment_path)?;
            let gain = db_gain(self.config.accompaniment_gain_db);
            for (i, sample) in track.iter_mut().enumerate() {
                if let Some(&acc) = accompaniment.get(i) {
                    let mixed = *sample as f64 + (acc as f64) * gain;
                    *sample = mixed.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                }
            }
        }

        if placements.len() < sorted.len() {
            warn!("some segments had no clone and were substituted with silence");
        }

        write_samples(dest, &track, sample_rate)?;
        Ok(warnings)
    }
}
