//! Interface to the host platform's entity layer
//!
//! The pipeline never creates or destroys platform objects itself. It hands
//! [`Action`]s to an [`EntitySink`], which maps them onto sensors and media
//! players. [`StreamView::attributes`] provides the attribute table those
//! entities expose.

use crate::models::StreamView;
use crate::reconcile::Action;
use serde_json::{Map, Value};

/// Applies reconciliation actions to platform entities
pub trait EntitySink {
    fn apply(&mut self, action: &Action);
}

impl EntitySink for Vec<Action> {
    fn apply(&mut self, action: &Action) {
        self.push(action.clone());
    }
}

/// Applies a batch in order
pub fn apply_actions<S: EntitySink + ?Sized>(sink: &mut S, actions: &[Action]) {
    for action in actions {
        sink.apply(action);
    }
}

impl StreamView {
    /// Media title shown by a media player: episode title, else program title
    pub fn media_title(&self) -> Option<&str> {
        self.episode_title
            .as_deref()
            .or(self.program_title.as_deref())
    }

    /// Series title shown by a media player
    pub fn series_title(&self) -> Option<&str> {
        self.program_title.as_deref()
    }

    /// Attribute table of the stream entity
    ///
    /// Every key is always present; missing values are `null`. Timestamps
    /// are RFC 3339 with their offset.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert("channel_number".into(), opt_str(&self.channel_number));
        attrs.insert("channel_name".into(), opt_str(&self.channel_name));
        attrs.insert("program_title".into(), opt_str(&self.program_title));
        attrs.insert("episode_title".into(), opt_str(&self.episode_title));
        attrs.insert("episode_number".into(), opt_str(&self.episode_number));
        attrs.insert("program_description".into(), opt_str(&self.description));
        attrs.insert(
            "program_start".into(),
            self.program_start
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        attrs.insert(
            "program_stop".into(),
            self.program_stop
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        attrs.insert(
            "clients".into(),
            self.clients.map(Value::from).unwrap_or(Value::Null),
        );
        attrs.insert("resolution".into(), opt_str(&self.resolution));
        attrs.insert(
            "fps".into(),
            self.fps.map(Value::from).unwrap_or(Value::Null),
        );
        attrs.insert("video_codec".into(), opt_str(&self.video_codec));
        attrs.insert("audio_codec".into(), opt_str(&self.audio_codec));
        attrs.insert("avg_bitrate".into(), opt_str(&self.avg_bitrate));
        attrs.insert("logo_url".into(), opt_str(&self.logo_url));
        attrs
    }
}

fn opt_str(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}
