use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RouterError;
use crate::interface::Options;
use crate::router::{Callbacks, DispatchMode, Reply, Request, Router};

/// How a group walks its presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    Ordered,
    Random,
}

/// An ordered or randomized list of preset names used for fallback
/// playback. Persisted by the application; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub mode: GroupMode,
    pub presets: Vec<String>,
}

/// A named, persisted (service, options) bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub service: String,
    #[serde(flatten)]
    pub options: Options,
}

/// One in-flight group dispatch: the presets not yet attempted plus
/// everything needed to re-issue the request and report the final
/// outcome.
pub(crate) struct GroupState {
    remaining: VecDeque<Preset>,
    text: String,
    want_human: Option<String>,
    note: Option<HashMap<String, String>>,
    callbacks: Callbacks,
    mode: DispatchMode,
}

impl Router {
    /// Play `text` through the first preset of the group that can
    /// satisfy it.
    ///
    /// Preset names that no longer exist in the store are dropped. In
    /// random mode the resolved list is shuffled; duplicate names are
    /// kept so they weight selection. Per attempt only `miss` is
    /// forwarded; the outer `done`/`okay`|`fail`/`then` fire exactly
    /// once, when the group settles. A `BusyError` from any attempt
    /// stops the iteration immediately — the resource is occupied, not
    /// broken, so another preset would not help.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch_group(
        &mut self,
        text: &str,
        group: &Group,
        presets: &HashMap<String, Preset>,
        callbacks: Callbacks,
        want_human: Option<&str>,
        note: Option<&HashMap<String, String>>,
        mode: DispatchMode,
    ) {
        if group.presets.is_empty() {
            return callbacks.deliver(
                None,
                Err(RouterError::Validation("group has no presets defined".into())),
                text,
            );
        }

        let mut resolved: Vec<Preset> = group
            .presets
            .iter()
            .filter_map(|name| presets.get(name).cloned())
            .collect();
        if resolved.is_empty() {
            return callbacks.deliver(
                None,
                Err(RouterError::Validation(
                    "none of the group presets exist".into(),
                )),
                text,
            );
        }

        if group.mode == GroupMode::Random {
            resolved.shuffle(&mut self.rng);
        }

        self.next_group_id += 1;
        let group_id = self.next_group_id;
        self.groups.insert(
            group_id,
            GroupState {
                remaining: resolved.into(),
                text: text.to_owned(),
                want_human: want_human.map(str::to_owned),
                note: note.cloned(),
                callbacks,
                mode,
            },
        );
        debug!(group_id, "starting group dispatch");

        self.group_try_next(group_id).await;
    }

    /// Pop the next preset off and try playing the text with it.
    /// Boxed because a failing inline attempt recurses back in here.
    pub(crate) fn group_try_next(&mut self, group_id: u64) -> BoxFuture<'_, ()> {
        async move {
            let Some(state) = self.groups.get_mut(&group_id) else {
                return;
            };
            let mode = state.mode;

            match state.remaining.pop_front() {
                None => {
                    if let Some(state) = self.groups.remove(&group_id) {
                        debug!(group_id, "group exhausted");
                        let GroupState {
                            callbacks, text, ..
                        } = state;
                        callbacks.deliver(None, Err(RouterError::GroupExhausted), &text);
                    }
                }
                Some(preset) => {
                    let request = Request {
                        svc_id: preset.service,
                        text: state.text.clone(),
                        options: preset.options,
                        want_human: state.want_human.clone(),
                        note: state.note.clone(),
                    };
                    self.dispatch_reply(request, Reply::Group(group_id), mode)
                        .await;
                }
            }
        }
        .boxed()
    }

    /// A group attempt settled: forward `miss`, then either finish the
    /// group (success or busy) or advance to the next preset.
    pub(crate) async fn group_step(
        &mut self,
        group_id: u64,
        miss: Option<(String, usize)>,
        result: Result<PathBuf, RouterError>,
    ) {
        if let Some((svc_id, count)) = &miss {
            if let Some(state) = self.groups.get_mut(&group_id) {
                if let Some(miss) = state.callbacks.miss.as_mut() {
                    miss(svc_id, *count);
                }
            }
        }

        match result {
            Ok(path) => {
                if let Some(state) = self.groups.remove(&group_id) {
                    let GroupState {
                        callbacks, text, ..
                    } = state;
                    callbacks.deliver(None, Ok(path), &text);
                }
            }
            Err(err) if err.is_busy() => {
                // occupied, not broken: surface immediately
                if let Some(state) = self.groups.remove(&group_id) {
                    let GroupState {
                        callbacks, text, ..
                    } = state;
                    callbacks.deliver(None, Err(err), &text);
                }
            }
            Err(err) => {
                debug!(group_id, error = %err, "preset failed, advancing");
                self.group_try_next(group_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::OptionValue;

    #[test]
    fn presets_deserialize_with_flattened_options() {
        let preset: Preset = serde_json::from_str(
            r#"{"service": "google", "voice": "en-US", "speed": 1}"#,
        )
        .unwrap();
        assert_eq!(preset.service, "google");
        assert_eq!(
            preset.options.get("voice"),
            Some(&OptionValue::Str("en-US".into()))
        );
        assert_eq!(preset.options.get("speed"), Some(&OptionValue::Int(1)));
    }

    #[test]
    fn group_modes_deserialize_lowercase() {
        let group: Group =
            serde_json::from_str(r#"{"mode": "random", "presets": ["a", "b", "a"]}"#).unwrap();
        assert_eq!(group.mode, GroupMode::Random);
        assert_eq!(group.presets.len(), 3);
    }
}
