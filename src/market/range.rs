use crate::market::types::TimeRange;

pub fn overlap(a: TimeRange, b: TimeRange) -> Option<TimeRange> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    if start >= end {
        return None;
    }
    Some(TimeRange { start, end })
}

pub fn contains(container: TimeRange, inner: TimeRange) -> bool {
    container.start <= inner.start && container.end >= inner.end
}

/// The window that still has to be fetched for `requested` given what is
/// already `cached`. Only one-sided gaps are narrowed; a request that sticks
/// out on both sides, or does not overlap at all, is fetched whole.
pub fn missing_window(cached: TimeRange, requested: TimeRange) -> Option<TimeRange> {
    if contains(cached, requested) {
        return None;
    }

    let Some(shared) = overlap(cached, requested) else {
        return Some(requested);
    };

    if shared.start == requested.start {
        Some(TimeRange {
            start: shared.end,
            end: requested.end,
        })
    } else if shared.end == requested.end {
        Some(TimeRange {
            start: requested.start,
            end: shared.start,
        })
    } else {
        Some(requested)
    }
}
