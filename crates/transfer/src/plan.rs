//! Part planning: splits a byte range into contiguous spans.

use crate::{MAX_PARTS, TransferError};

/// One contiguous slice of the source, assigned to a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpan {
    /// 1-based part number; also the span's rank in source order.
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// How a transfer of a given size should proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Below the threshold: one request, no session, no checkpoint.
    SingleShot,
    /// At or above the threshold: the given spans, in order.
    Multipart(Vec<PartSpan>),
}

/// Scales `part_size` up until `total_size` fits in [`MAX_PARTS`] parts.
pub fn adjusted_part_size(total_size: u64, part_size: u64) -> u64 {
    let mut size = part_size;
    while total_size.div_ceil(size) > MAX_PARTS {
        size *= 2;
    }
    size
}

/// Plans a transfer of `total_size` bytes.
///
/// Every byte belongs to exactly one span; only the last span may be short.
/// An empty source is always single-shot, whatever the threshold.
pub fn plan(
    total_size: u64,
    part_size: u64,
    multipart_threshold: u64,
) -> Result<PlanDecision, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidInput(
            "part size must be non-zero".into(),
        ));
    }
    if total_size == 0 || total_size < multipart_threshold {
        return Ok(PlanDecision::SingleShot);
    }

    let part_size = adjusted_part_size(total_size, part_size);
    let count = total_size.div_ceil(part_size);
    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * part_size;
        parts.push(PartSpan {
            number: (i + 1) as u32,
            offset,
            len: part_size.min(total_size - offset),
        });
    }
    Ok(PlanDecision::Multipart(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(total: u64, part: u64) -> Vec<PartSpan> {
        match plan(total, part, 1).unwrap() {
            PlanDecision::Multipart(p) => p,
            PlanDecision::SingleShot => panic!("expected multipart"),
        }
    }

    #[test]
    fn zero_part_size_is_rejected() {
        assert!(matches!(
            plan(100, 0, 1),
            Err(TransferError::InvalidInput(_))
        ));
    }

    #[test]
    fn below_threshold_is_single_shot() {
        assert_eq!(
            plan(1024, 2 * 1024 * 1024, 2 * 1024 * 1024).unwrap(),
            PlanDecision::SingleShot
        );
    }

    #[test]
    fn empty_source_is_single_shot_even_with_zero_threshold() {
        assert_eq!(plan(0, 1024, 0).unwrap(), PlanDecision::SingleShot);
    }

    #[test]
    fn at_threshold_goes_multipart() {
        let decision = plan(2 * 1024 * 1024, 2 * 1024 * 1024, 2 * 1024 * 1024).unwrap();
        assert_eq!(
            decision,
            PlanDecision::Multipart(vec![PartSpan {
                number: 1,
                offset: 0,
                len: 2 * 1024 * 1024,
            }])
        );
    }

    #[test]
    fn spans_are_contiguous_and_cover_the_source() {
        for (total, part) in [(10, 3), (10, 10), (10, 4), (1000, 1), (999, 250)] {
            let parts = spans(total, part);
            let mut next_offset = 0;
            for (i, span) in parts.iter().enumerate() {
                assert_eq!(span.number as usize, i + 1);
                assert_eq!(span.offset, next_offset);
                assert!(span.len > 0);
                next_offset += span.len;
            }
            assert_eq!(next_offset, total);
            let sum: u64 = parts.iter().map(|p| p.len).sum();
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn only_last_span_may_be_short() {
        let parts = spans(10, 4);
        assert_eq!(
            parts.iter().map(|p| p.len).collect::<Vec<_>>(),
            vec![4, 4, 2]
        );
    }

    #[test]
    fn part_size_scales_to_stay_under_cap() {
        // 40 GiB at 2 MiB would be 20480 parts; one doubling brings it under.
        let total = 40 * 1024 * 1024 * 1024u64;
        let adjusted = adjusted_part_size(total, 2 * 1024 * 1024);
        assert_eq!(adjusted, 4 * 1024 * 1024);
        assert!(total.div_ceil(adjusted) <= MAX_PARTS);

        // Already under the cap: untouched.
        assert_eq!(adjusted_part_size(100, 7), 7);
    }
}
