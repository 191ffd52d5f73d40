//! The canonical structured state of a task: an ordered sequence of
//! `Segment` records with timings, text, translation, speaker id, and
//! cloned-audio path (spec §3, §4.3).

use crate::error::{DubError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A word with its timestamp, covering a span inside its parent segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// A contiguous interval of the source audio with its transcript,
/// translation, speaker, and cloned-audio state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTimestamp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_audio_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_duration: Option<f64>,
    /// Set when stage 7 cloning failed for this segment specifically; the
    /// task as a whole still completes (spec §7 propagation policy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Segment {
    pub fn original_duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn duration_multiplier(&self) -> Option<f64> {
        let cloned = self.cloned_duration?;
        let original = self.original_duration();
        if original <= 0.0 {
            None
        } else {
            Some(cloned / original)
        }
    }

    /// Clears the fields that no longer apply once text or timing changes
    /// (spec §4.3: split/merge/delete/text-update invalidation rule).
    pub fn clear_downstream(&mut self) {
        self.translated_text = None;
        self.cloned_audio_path = None;
        self.cloned_duration = None;
        self.error = None;
    }
}

/// The ordered, validated collection of segments for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentTable {
    pub segments: Vec<Segment>,
}

impl SegmentTable {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Validates the invariants of spec §3/§8.1: sorted by `start`, ids
    /// dense starting at 0, no empty or inverted interval.
    pub fn validate(&self) -> Result<()> {
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.id != i {
                return Err(DubError::InvalidRequest(format!(
                    "segment ids must be dense and 0-based: expected {i}, found {}",
                    seg.id
                )));
            }
            if seg.end <= seg.start {
                return Err(DubError::InvalidRequest(format!(
                    "segment {} has end <= start ({} <= {})",
                    seg.id, seg.end, seg.start
                )));
            }
            if i > 0 && seg.start < self.segments[i - 1].start {
                return Err(DubError::InvalidRequest(
                    "segments must be sorted by start".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn renumber(&mut self) {
        for (i, seg) in self.segments.iter_mut().enumerate() {
            seg.id = i;
        }
    }

    /// Splits segment `id` at the word whose character span contains
    /// `text_offset` (spec §4.3). The left half keeps `[start, word.end]`,
    /// the right half takes `[word.end, original_end]`; both halves lose
    /// their translation and cloned audio.
    pub fn split(&self, id: usize, text_offset: usize) -> Result<SegmentTable> {
        let idx = self.index_of(id)?;
        let seg = &self.segments[idx];

        if text_offset == 0 || text_offset >= seg.text.len() {
            return Err(DubError::InvalidRequest(
                "text_offset must fall strictly inside the segment's text".to_string(),
            ));
        }
        if !seg.text.is_char_boundary(text_offset) {
            return Err(DubError::InvalidRequest(
                "text_offset does not fall on a character boundary".to_string(),
            ));
        }

        let split_point = word_end_time_at_offset(seg, text_offset);

        let left_text = seg.text[..text_offset].trim().to_string();
        let right_text = seg.text[text_offset..].trim().to_string();
        if left_text.is_empty() || right_text.is_empty() {
            return Err(DubError::InvalidRequest(
                "split would produce an empty segment".to_string(),
            ));
        }

        let mut left = seg.clone();
        left.end = split_point;
        left.text = left_text;
        left.clear_downstream();
        left.words = None;

        let mut right = seg.clone();
        right.start = split_point;
        right.text = right_text;
        right.clear_downstream();
        right.words = None;

        let mut new_segments = self.segments.clone();
        new_segments.splice(idx..=idx, [left, right]);

        let mut table = SegmentTable::new(new_segments);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// Merges adjacent segment ids into one, concatenating text with a
    /// single space and clearing translation/cloned audio (spec §4.3).
    pub fn merge(&self, ids: &[usize]) -> Result<SegmentTable> {
        if ids.len() < 2 {
            return Err(DubError::InvalidRequest(
                "merge requires at least two ids".to_string(),
            ));
        }
        let mut sorted_ids = ids.to_vec();
        sorted_ids.sort_unstable();
        sorted_ids.dedup();
        if sorted_ids.len() != ids.len() {
            return Err(DubError::InvalidRequest(
                "merge ids must be unique".to_string(),
            ));
        }
        for pair in sorted_ids.windows(2) {
            if pair[1] != pair[0] + 1 {
                return Err(DubError::InvalidRequest(
                    "merge ids must be contiguous and adjacent".to_string(),
                ));
            }
        }

        let first_idx = self.index_of(sorted_ids[0])?;
        let last_idx = self.index_of(*sorted_ids.last().unwrap())?;

        let merged_start = self.segments[first_idx].start;
        let merged_end = self.segments[last_idx].end;
        let merged_text = self.segments[first_idx..=last_idx]
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let speaker_id = self.segments[first_idx].speaker_id.clone();

        let mut merged = Segment {
            id: 0,
            start: merged_start,
            end: merged_end,
            text: merged_text,
            translated_text: None,
            speaker_id,
            words: None,
            cloned_audio_path: None,
            cloned_duration: None,
            error: None,
        };
        merged.clear_downstream();

        let mut new_segments = self.segments.clone();
        new_segments.splice(first_idx..=last_idx, [merged]);

        let mut table = SegmentTable::new(new_segments);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// Removes the given ids and renumbers the remaining ones.
    pub fn delete(&self, ids: &[usize]) -> Result<SegmentTable> {
        let keep: Vec<Segment> = self
            .segments
            .iter()
            .filter(|s| !ids.contains(&s.id))
            .cloned()
            .collect();
        let mut table = SegmentTable::new(keep);
        table.renumber();
        table.validate()?;
        Ok(table)
    }

    /// A patch to apply with `update`; `None` fields are left unchanged.
    pub fn update(&self, id: usize, patch: SegmentPatch) -> Result<SegmentTable> {
        let idx = self.index_of(id)?;
        let mut new_segments = self.segments.clone();
        let seg = &mut new_segments[idx];

        let text_changed = patch.text.is_some() && patch.text.as_deref() != Some(seg.text.as_str());
        let timing_changed = patch.start.is_some() || patch.end.is_some();

        if let Some(start) = patch.start {
            seg.start = start;
        }
        if let Some(end) = patch.end {
            seg.end = end;
        }
        if let Some(text) = patch.text {
            seg.text = text;
        }

        if text_changed || timing_changed {
            if let Some(translated) = patch.translated_text {
                seg.translated_text = Some(translated);
                seg.cloned_audio_path = None;
                seg.cloned_duration = None;
                seg.error = None;
            } else {
                seg.clear_downstream();
            }
        } else if let Some(translated) = patch.translated_text {
            seg.translated_text = Some(translated);
        }

        let mut table = SegmentTable::new(new_segments);
        table.validate()?;
        Ok(table)
    }

    fn index_of(&self, id: usize) -> Result<usize> {
        self.segments
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| DubError::InvalidRequest(format!("no segment with id {id}")))
    }

    pub fn get(&self, id: usize) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }
}

/// Partial update accepted by `SegmentTable::update` (spec §4.3).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SegmentPatch {
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub translated_text: Option<String>,
}

/// Finds the end time of the word whose character span covers
/// `text_offset`, falling back to the segment midpoint in time when no
/// word-level timestamps are available (e.g. a Whisper-only transcript).
fn word_end_time_at_offset(seg: &Segment, text_offset: usize) -> f64 {
    if let Some(words) = &seg.words {
        let mut cursor = 0usize;
        for (i, w) in words.iter().enumerate() {
            let word_start = seg.text[cursor..]
                .find(&w.word)
                .map(|p| cursor + p)
                .unwrap_or(cursor);
            let word_end = word_start + w.word.len();
            cursor = word_end;
            if text_offset <= word_end || i == words.len() - 1 {
                return w.end;
            }
        }
    }

    let fraction = text_offset as f64 / seg.text.len().max(1) as f64;
    seg.start + (seg.end - seg.start) * fraction
}
