use crate::model::*;

// ── Slot calculation ──────────────────────────────────────────────

/// Grid used to offer slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotParams {
    /// Distance between consecutive candidate starts.
    pub step: Minute,
    /// Requested durations are rounded up to a multiple of this.
    pub slice: Minute,
    /// Gap kept free before and after every existing booking.
    pub offset: Minute,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            step: 15,
            slice: 30,
            offset: 15,
        }
    }
}

/// `ceil(requested / slice) * slice`, with a zero request treated as one minute.
pub fn normalize_duration(requested: Minute, slice: Minute) -> u32 {
    let slice = u32::from(slice.max(1));
    u32::from(requested.max(1)).div_ceil(slice) * slice
}

/// Open slots for one resource-day, in increasing start order.
///
/// The iterator owns everything it needs: cloning it (or calling
/// [`compute_available_slots`] again) restarts the sequence from the beginning.
#[derive(Debug, Clone)]
pub struct AvailableSlots {
    /// Buffered existing intervals, sorted and merged.
    blocked: Vec<Interval>,
    cursor: usize,
    duration: u32,
    step: u32,
    next_start: u32,
}

impl AvailableSlots {
    pub fn duration(&self) -> u32 {
        self.duration
    }
}

impl Iterator for AvailableSlots {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        let day = u32::from(MINUTES_PER_DAY);
        while self.next_start + self.duration <= day {
            let start = self.next_start;
            let end = start + self.duration;
            self.next_start += self.step;

            // Candidate starts only grow, so blocked intervals that ended are never needed again.
            while self.cursor < self.blocked.len()
                && u32::from(self.blocked[self.cursor].end) <= start
            {
                self.cursor += 1;
            }
            let hit = self
                .blocked
                .get(self.cursor)
                .is_some_and(|b| u32::from(b.start) < end);
            if !hit {
                return Some(Interval::new(start as Minute, end as Minute));
            }
        }
        None
    }
}

/// Candidate slots of the normalized duration that keep `params.offset`
/// minutes away from every existing interval.
///
/// Runs in `O(n log n + slots)`: existing intervals are buffered, merged once,
/// and then swept alongside the candidate grid.
pub fn compute_available_slots(
    existing: &[Interval],
    requested_duration: Minute,
    params: &SlotParams,
) -> AvailableSlots {
    let mut blocked: Vec<Interval> = existing.iter().map(|i| i.buffered(params.offset)).collect();
    blocked.sort_by_key(|i| i.start);
    AvailableSlots {
        blocked: merge_overlapping(&blocked),
        cursor: 0,
        duration: normalize_duration(requested_duration, params.slice),
        step: u32::from(params.step.max(1)),
        next_start: 0,
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Interval]) -> Vec<Interval> {
    let mut merged: Vec<Interval> = Vec::new();
    for &interval in sorted {
        if let Some(last) = merged.last_mut()
            && interval.start <= last.end
        {
            last.end = last.end.max(interval.end);
            continue;
        }
        merged.push(interval);
    }
    merged
}
