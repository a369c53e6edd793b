use model::{StateDict, BACKBONE_PREFIX};

/// Drops every state-dict entry whose key contains one of the markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDictFilter {
    exclude: Vec<String>,
}

impl StateDictFilter {
    /// Keeps everything.
    pub fn keep_all() -> Self {
        Self::default()
    }

    pub fn excluding<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// Leaves out the pretrained sensor encoder.
    pub fn sensor_backbone() -> Self {
        Self::excluding([BACKBONE_PREFIX])
    }

    pub fn markers(&self) -> &[String] {
        &self.exclude
    }

    pub fn excludes(&self, key: &str) -> bool {
        self.exclude.iter().any(|marker| key.contains(marker.as_str()))
    }

    /// Retained entries keep their values and relative order.
    pub fn apply(&self, mut state: StateDict) -> StateDict {
        state.retain(|key, _| !self.excludes(key));
        state
    }

    /// Keys `apply` would drop, in snapshot order.
    pub fn excluded_keys(&self, state: &StateDict) -> Vec<String> {
        state
            .keys()
            .filter(|key| self.excludes(key))
            .map(str::to_string)
            .collect()
    }
}
