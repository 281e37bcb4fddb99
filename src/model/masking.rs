//! Span masking and negative sampling for the contrastive objective.
//!
//! Both samplers draw from a caller-owned RNG so a seeded `ChaCha8Rng`
//! reproduces the exact same masks and distractors.

use candle_core::{Device, Tensor};
use rand::Rng;

use crate::{Error, Result};

/// Sample time-mask spans.
///
/// For each item, `⌊mask_prob · len / mask_length + ε⌋` spans (at least
/// `min_masks`) of `mask_length` consecutive frames start at distinct
/// positions; `ε ~ U[0, 1)` is drawn once per call. Spans may overlap and are
/// clipped at the sequence end. `input_lengths` gives the valid frame count per
/// item (default: the full sequence).
///
/// Returns a `[B][T]` boolean mask.
pub fn compute_mask_indices<R: Rng + ?Sized>(
    shape: (usize, usize),
    mask_prob: f64,
    mask_length: usize,
    min_masks: usize,
    input_lengths: Option<&[usize]>,
    rng: &mut R,
) -> Result<Vec<Vec<bool>>> {
    let (batch, seq_len) = shape;
    if mask_length < 1 {
        return Err(Error::Masking("mask_length must be >= 1".into()));
    }
    if mask_length > seq_len {
        return Err(Error::Masking(format!(
            "mask_length {mask_length} exceeds sequence length {seq_len}"
        )));
    }

    if let Some(lens) = input_lengths {
        if lens.len() != batch {
            return Err(Error::Masking(format!(
                "{} input lengths for a batch of {batch}",
                lens.len()
            )));
        }
    }

    let epsilon: f64 = rng.random();
    let num_spans_for = |input_length: usize| -> usize {
        let mut spans = (mask_prob * input_length as f64 / mask_length as f64 + epsilon) as usize;
        spans = spans.max(min_masks);
        if spans * mask_length > seq_len {
            spans = seq_len / mask_length;
        }
        let room = (input_length + 1).saturating_sub(mask_length);
        spans.min(room)
    };

    let mut mask = vec![vec![false; seq_len]; batch];
    if num_spans_for(seq_len) == 0 {
        return Ok(mask);
    }

    for (b, row) in mask.iter_mut().enumerate() {
        let input_length = input_lengths.map_or(seq_len, |lens| lens[b].min(seq_len));
        let spans = num_spans_for(input_length);
        let room = (input_length + 1).saturating_sub(mask_length);
        let starts = rand::seq::index::sample(rng, room, spans).into_vec();
        if starts.is_empty() {
            // Padding span for items too short to mask: the last frame.
            row[seq_len - 1] = true;
            continue;
        }
        for start in starts {
            for offset in 0..mask_length {
                row[(start + offset).min(seq_len - 1)] = true;
            }
        }
    }
    Ok(mask)
}

/// Sample `num_negatives` distractor indices for every frame.
///
/// Candidates for item `b` are its frames where `candidates[b]` is true (all
/// frames when `None`). A frame never samples itself unless it is the only
/// candidate. Indices are offset by `b · T` so they address the flattened
/// `[B·T, H]` feature table; non-candidate frames keep index `b · T`.
///
/// Returns a `[B, T, K]` u32 tensor.
pub fn sample_negative_indices<R: Rng + ?Sized>(
    shape: (usize, usize),
    num_negatives: usize,
    candidates: Option<&[Vec<bool>]>,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let (batch, seq_len) = shape;
    if let Some(rows) = candidates {
        if rows.len() != batch || rows.iter().any(|r| r.len() != seq_len) {
            return Err(Error::Masking(format!(
                "candidate mask must be {batch} x {seq_len}"
            )));
        }
    }
    let mut indices = vec![0u32; batch * seq_len * num_negatives];

    for b in 0..batch {
        let mapped: Vec<usize> = match candidates {
            Some(rows) => (0..seq_len).filter(|&t| rows[b][t]).collect(),
            None => (0..seq_len).collect(),
        };
        let offset = b * seq_len;
        let row = &mut indices[offset * num_negatives..(offset + seq_len) * num_negatives];
        row.iter_mut().for_each(|i| *i = offset as u32);

        let high = mapped.len().saturating_sub(1);
        for (feature_idx, &t) in mapped.iter().enumerate() {
            for k in 0..num_negatives {
                let sampled = if high == 0 {
                    feature_idx
                } else {
                    let s = rng.random_range(0..high);
                    if s >= feature_idx { s + 1 } else { s }
                };
                row[t * num_negatives + k] = (offset + mapped[sampled]) as u32;
            }
        }
    }

    Ok(Tensor::from_vec(
        indices,
        (batch, seq_len, num_negatives),
        device,
    )?)
}

/// `[B][T]` boolean mask → `[B, T]` u8 tensor.
pub fn mask_to_tensor(mask: &[Vec<bool>], device: &Device) -> Result<Tensor> {
    let batch = mask.len();
    let seq_len = mask.first().map_or(0, Vec::len);
    let flat: Vec<u8> = mask.iter().flatten().map(|&m| u8::from(m)).collect();
    Ok(Tensor::from_vec(flat, (batch, seq_len), device)?)
}
