use crate::model::*;

use super::store::Reservation;

/// Free time inside `open`, minus active reservations. With `min_len`, gaps
/// shorter than that are dropped.
pub fn free_spans(open: Span, taken: &[Reservation], min_len: Option<Minute>) -> Vec<Span> {
    let mut busy: Vec<Span> = taken.iter().filter_map(|r| r.span.intersect(&open)).collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let mut free = subtract_intervals(&[open], &busy);
    if let Some(len) = min_len {
        free.retain(|s| s.duration() >= len);
    }
    free
}

/// Merge start-sorted spans that overlap or touch.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
