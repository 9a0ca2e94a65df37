//! Projection of raw streams into [`StreamView`]s

use crate::models::{EpgProgram, RawStreamRecord, StreamView};

/// Number of identity characters used in fallback names
const FALLBACK_ID_LEN: usize = 6;

/// Normalizes a channel name into an entity-id friendly slug
///
/// Lowercase, every run of characters outside `[a-z0-9]` collapsed into a
/// single `_`, no leading or trailing separator. Returns an empty string
/// when nothing usable is left.
///
/// ```
/// use pmodispatcharr::projector::normalize_entity_name;
///
/// assert_eq!(normalize_entity_name("BBC One (HD)"), "bbc_one_hd");
/// ```
pub fn normalize_entity_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;

    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(c);
        } else {
            pending_separator = true;
        }
    }

    slug
}

/// `S<season>E<episode>`, only when both numbers are known
pub fn format_episode_number(season: Option<u32>, episode: Option<u32>) -> Option<String> {
    match (season, episode) {
        (Some(s), Some(e)) => Some(format!("S{}E{}", s, e)),
        _ => None,
    }
}

fn display_name_for(raw: &RawStreamRecord) -> String {
    if let Some(name) = [raw.channel_name.as_deref(), raw.stream_name.as_deref()]
        .into_iter()
        .flatten()
        .map(normalize_entity_name)
        .find(|name| !name.is_empty())
    {
        return name;
    }

    let skip = raw.channel_id.chars().count().saturating_sub(FALLBACK_ID_LEN);
    let short: String = raw.channel_id.chars().skip(skip).collect();
    normalize_entity_name(&format!("stream {}", short))
}

/// Builds the view of one stream; never fails
pub fn project(raw: &RawStreamRecord, matched: Option<&EpgProgram>) -> StreamView {
    let (season, episode) = matched
        .map(EpgProgram::season_episode)
        .unwrap_or((None, None));

    StreamView {
        identity: raw.identity(),
        display_name: display_name_for(raw),
        channel_name: raw.channel_name.clone().or_else(|| raw.stream_name.clone()),
        channel_number: raw.channel_number.clone(),
        program_title: matched.and_then(|p| p.title.clone()),
        episode_title: matched.and_then(|p| p.sub_title.clone()),
        episode_number: format_episode_number(season, episode),
        description: matched.and_then(|p| p.description.clone()),
        program_start: matched.map(|p| p.start),
        program_stop: matched.map(|p| p.stop),
        clients: raw.client_count,
        resolution: raw.resolution.clone(),
        fps: raw.source_fps,
        video_codec: raw.video_codec.clone(),
        audio_codec: raw.audio_codec.clone(),
        avg_bitrate: raw.avg_bitrate.clone(),
        logo_url: raw.logo_url.clone(),
    }
}
