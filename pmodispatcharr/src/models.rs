//! Data models for the Dispatcharr API and the reconciliation pipeline
//!
//! The wire structures (`StatusChannel`, `ChannelDetails`, `EpgGridEntry`)
//! mirror what Dispatcharr returns and are deliberately lenient: every
//! field the pipeline can live without is optional. They are turned into
//! the pipeline types (`RawStreamRecord`, `EpgProgram`, `EpgDataset`) by
//! the API layer.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Accepts an identifier sent either as a JSON string or a number
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(Error::custom("ID must be a string or number")),
    }
}

/// Same as [`deserialize_id`] but tolerates `null` and missing values
pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Channel numbers come as floats (`7.0`, `7.1`); render them the way a
/// user types them.
pub(crate) fn deserialize_channel_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().map(format_channel_number),
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    })
}

/// Season/episode numbers, sent as integers or numeric strings
pub(crate) fn deserialize_opt_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Guide timestamps: RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` read as UTC.
/// Anything else decodes as `None`.
pub(crate) fn deserialize_opt_datetime<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde_json::Value;

    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => parse_guide_time(s.trim()),
        _ => None,
    })
}

fn parse_guide_time(s: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
}

fn format_channel_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

// ============================================================================
// Identity & credentials
// ============================================================================

/// Stable key of one active stream: the backend channel UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamIdentity(pub String);

impl StreamIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Bearer credential returned by the login exchange
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(access: impl Into<String>) -> Self {
        Self(access.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

/// Answer of `POST /api/accounts/token/`
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub refresh: Option<String>,
    /// Lifetime in seconds, when the backend tells us
    #[serde(default)]
    pub expires_in: Option<u64>,
}

// ============================================================================
// Active streams
// ============================================================================

/// Answer of `GET /proxy/ts/status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub channels: Vec<StatusChannel>,
    #[serde(default)]
    pub count: Option<u64>,
}

/// One active channel as reported by the TS proxy
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusChannel {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub client_count: Option<u32>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub source_fps: Option<f64>,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    /// Already formatted by the backend, e.g. `"4521.3 kbps"`
    #[serde(default)]
    pub avg_bitrate: Option<String>,
}

/// Entry of the channel catalogue `GET /api/channels/channels/`
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelDetails {
    #[serde(deserialize_with = "deserialize_id")]
    pub uuid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_channel_number")]
    pub channel_number: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub tvg_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub logo_id: Option<String>,
}

/// One active stream, joined with its catalogue entry
///
/// Lives for a single fetch cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStreamRecord {
    pub channel_id: String,
    pub channel_number: Option<String>,
    pub channel_name: Option<String>,
    /// XMLTV id used to key the EPG
    pub epg_channel_id: Option<String>,
    pub stream_name: Option<String>,
    pub logo_url: Option<String>,
    pub client_count: Option<u32>,
    pub resolution: Option<String>,
    pub source_fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub avg_bitrate: Option<String>,
}

impl RawStreamRecord {
    pub fn identity(&self) -> StreamIdentity {
        StreamIdentity(self.channel_id.clone())
    }

    /// Key used to look the channel up in the EPG dataset
    pub fn epg_key(&self) -> &str {
        self.epg_channel_id.as_deref().unwrap_or(&self.channel_id)
    }
}

// ============================================================================
// EPG
// ============================================================================

/// Answer of `GET /api/epg/grid/`; older servers return a bare list
///
/// Entries stay as raw JSON so that one undecodable entry only loses
/// itself, not the whole guide.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EpgGridResponse {
    Wrapped { data: Vec<serde_json::Value> },
    List(Vec<serde_json::Value>),
}

impl EpgGridResponse {
    pub fn len(&self) -> usize {
        match self {
            EpgGridResponse::Wrapped { data } => data.len(),
            EpgGridResponse::List(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes every entry on its own, skipping those that do not decode
    pub fn into_entries(self) -> Vec<EpgGridEntry> {
        let raw = match self {
            EpgGridResponse::Wrapped { data } => data,
            EpgGridResponse::List(list) => list,
        };
        raw.into_iter()
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    /// Well-formed programs only
    pub fn into_programs(self) -> Vec<EpgProgram> {
        self.into_entries()
            .into_iter()
            .filter_map(|entry| EpgProgram::try_from(entry).ok())
            .collect()
    }
}

/// Raw guide entry; incomplete entries are dropped when building the dataset
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpgGridEntry {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub tvg_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "subtitle")]
    pub sub_title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_datetime")]
    pub start_time: Option<DateTime<FixedOffset>>,
    #[serde(default, deserialize_with = "deserialize_opt_datetime")]
    pub end_time: Option<DateTime<FixedOffset>>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub season: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub episode: Option<u32>,
    #[serde(default)]
    pub episode_num: Option<String>,
    #[serde(default)]
    pub custom_properties: Option<ProgramProperties>,
}

/// Extra XMLTV properties Dispatcharr stores alongside a program
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgramProperties {
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub season: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_opt_u32")]
    pub episode: Option<u32>,
    #[serde(default)]
    pub onscreen_episode: Option<String>,
}

/// One guide entry with a well-formed `[start, stop)` interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpgProgram {
    pub channel_id: String,
    pub title: Option<String>,
    pub sub_title: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// On-screen episode string such as `S01E05`
    pub episode_num: Option<String>,
    pub description: Option<String>,
    pub start: DateTime<FixedOffset>,
    pub stop: DateTime<FixedOffset>,
}

fn episode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)S\s*(\d+)\s*E\s*(\d+)").expect("episode pattern is a valid regex")
    })
}

impl EpgProgram {
    /// Season and episode, falling back to the on-screen string
    pub fn season_episode(&self) -> (Option<u32>, Option<u32>) {
        if self.season.is_some() && self.episode.is_some() {
            return (self.season, self.episode);
        }
        let parsed = self
            .episode_num
            .as_deref()
            .and_then(|s| episode_pattern().captures(s))
            .and_then(|cap| Some((cap[1].parse().ok()?, cap[2].parse().ok()?)));
        match parsed {
            Some((season, episode)) => (Some(season), Some(episode)),
            None => (self.season, self.episode),
        }
    }

    /// True when `now` falls inside `[start, stop)`
    pub fn is_airing_at(&self, now: DateTime<FixedOffset>) -> bool {
        self.start <= now && now < self.stop
    }
}

impl TryFrom<EpgGridEntry> for EpgProgram {
    type Error = &'static str;

    fn try_from(entry: EpgGridEntry) -> Result<Self, Self::Error> {
        let channel_id = entry.tvg_id.ok_or("missing tvg_id")?;
        let start = entry.start_time.ok_or("missing start_time")?;
        let stop = entry.end_time.ok_or("missing end_time")?;
        if stop <= start {
            return Err("empty or inverted interval");
        }
        let props = entry.custom_properties.unwrap_or_default();
        Ok(Self {
            channel_id,
            title: entry.title,
            sub_title: entry.sub_title,
            season: entry.season.or(props.season),
            episode: entry.episode.or(props.episode),
            episode_num: entry.episode_num.or(props.onscreen_episode),
            description: entry.description,
            start,
            stop,
        })
    }
}

/// Guide data partitioned by channel, each partition ordered by start
#[derive(Debug, Clone, Default)]
pub struct EpgDataset {
    by_channel: HashMap<String, Vec<EpgProgram>>,
}

impl EpgDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_programs(programs: impl IntoIterator<Item = EpgProgram>) -> Self {
        let mut by_channel: HashMap<String, Vec<EpgProgram>> = HashMap::new();
        for program in programs {
            by_channel
                .entry(program.channel_id.clone())
                .or_default()
                .push(program);
        }
        for list in by_channel.values_mut() {
            list.sort_by_key(|p| p.start);
        }
        Self { by_channel }
    }

    /// Programs of one channel, ordered by start
    pub fn programs_for(&self, channel_id: &str) -> &[EpgProgram] {
        self.by_channel
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    /// Total number of programs
    pub fn len(&self) -> usize {
        self.by_channel.values().map(Vec::len).sum()
    }

    pub fn channel_count(&self) -> usize {
        self.by_channel.len()
    }
}

// ============================================================================
// Stream view
// ============================================================================

/// Normalized, externally visible state of one active stream
///
/// Program related fields are always present, `None` when no program
/// matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamView {
    pub identity: StreamIdentity,
    /// Entity-id friendly form of the channel name
    pub display_name: String,
    pub channel_name: Option<String>,
    pub channel_number: Option<String>,
    pub program_title: Option<String>,
    pub episode_title: Option<String>,
    pub episode_number: Option<String>,
    pub description: Option<String>,
    pub program_start: Option<DateTime<FixedOffset>>,
    pub program_stop: Option<DateTime<FixedOffset>>,
    pub clients: Option<u32>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub avg_bitrate: Option<String>,
    pub logo_url: Option<String>,
}
