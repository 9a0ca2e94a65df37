//! Current-program lookup in the EPG

use crate::models::{EpgDataset, EpgProgram};
use chrono::{DateTime, FixedOffset};

/// Finds the program airing on `channel_id` at `now`
///
/// `epg` is `None` when the EPG feature is turned off; the lookup then
/// returns `None` without looking at anything. Overlapping entries (broken
/// guide data) resolve to the one that started last. A miss is an ordinary
/// outcome, not an error.
pub fn match_program<'a>(
    channel_id: &str,
    epg: Option<&'a EpgDataset>,
    now: DateTime<FixedOffset>,
) -> Option<&'a EpgProgram> {
    let epg = epg?;
    if epg.is_empty() {
        return None;
    }

    // Partitions are sorted by start: everything past `now` can be skipped,
    // and the last candidate standing has the latest start.
    let programs = epg.programs_for(channel_id);
    let upper = programs.partition_point(|p| p.start <= now);
    programs[..upper].iter().rev().find(|p| now < p.stop)
}
