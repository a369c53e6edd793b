use std::collections::HashMap;

use candle_core::Tensor;

/// Ordered mapping from dotted parameter path to tensor.
///
/// Insertion order is preserved so that filtering and serialization keep the
/// module declaration order of the model that produced the snapshot. Lookups
/// go through a name index kept in step with `entries`.
#[derive(Debug, Clone, Default)]
pub struct StateDict {
    entries: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Inserts `tensor` under `name`, replacing (in place) any existing entry.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        let name = name.into();
        if let Some(&position) = self.index.get(&name) {
            return Some(std::mem::replace(&mut self.entries[position].1, tensor));
        }
        self.index.insert(name.clone(), self.entries.len());
        self.entries.push((name, tensor));
        None
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index
            .get(name)
            .map(|&position| &self.entries[position].1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        let position = self.index.remove(name)?;
        let (_, tensor) = self.entries.remove(position);
        for (key, _) in &self.entries[position..] {
            if let Some(slot) = self.index.get_mut(key) {
                *slot -= 1;
            }
        }
        Some(tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(key, tensor)| (key.as_str(), tensor))
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str, &Tensor) -> bool,
    {
        self.entries.retain(|(key, tensor)| keep(key, tensor));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (position, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), position);
        }
    }

    /// Total number of scalar elements across all entries.
    pub fn numel(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, tensor)| tensor.elem_count())
            .sum()
    }

    /// Unordered view consumed by the safetensors writer.
    pub fn to_hashmap(&self) -> HashMap<String, Tensor> {
        self.entries.iter().cloned().collect()
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        let mut dict = StateDict::new();
        for (key, tensor) in iter {
            dict.insert(key, tensor);
        }
        dict
    }
}

impl IntoIterator for StateDict {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Named input tensors for a single forward pass.
#[derive(Debug, Clone, Default)]
pub struct BatchInputs {
    fields: HashMap<String, Tensor>,
}

impl BatchInputs {
    pub const SENSOR_VALUES: &'static str = "sensor_values";
    pub const LABELS: &'static str = "labels";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.fields.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.fields.get(name)
    }

    /// Removes and returns `name`; later forward passes no longer see it.
    pub fn take(&mut self, name: &str) -> Option<Tensor> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Leading dimension of the sensor tensor, when present.
    pub fn batch_size(&self) -> Option<usize> {
        self.fields
            .get(Self::SENSOR_VALUES)
            .and_then(|tensor| tensor.dims().first().copied())
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    logits: Option<Tensor>,
    hidden_states: Option<Tensor>,
}

impl ModelOutput {
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits: Some(logits),
            hidden_states: None,
        }
    }

    pub fn with_hidden_states(mut self, hidden: Tensor) -> Self {
        self.hidden_states = Some(hidden);
        self
    }

    pub fn logits(&self) -> Option<&Tensor> {
        self.logits.as_ref()
    }

    pub fn hidden_states(&self) -> Option<&Tensor> {
        self.hidden_states.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(value: f32) -> Tensor {
        Tensor::new(value, &Device::Cpu).unwrap()
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut dict = StateDict::new();
        dict.insert("a", scalar(1.0));
        dict.insert("b", scalar(2.0));
        let previous = dict.insert("a", scalar(3.0));

        assert!(previous.is_some());
        assert_eq!(dict.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        let value = dict.get("a").unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(value, 3.0);
    }

    #[test]
    fn lookups_stay_consistent_after_remove_and_retain() {
        let mut dict: StateDict = (0..6)
            .map(|i| (format!("layer{i}.weight"), scalar(i as f32)))
            .collect();

        assert_eq!(dict.remove("layer1.weight").unwrap().to_scalar::<f32>().unwrap(), 1.0);
        assert!(dict.remove("layer1.weight").is_none());
        dict.retain(|key, _| key != "layer3.weight");
        dict.insert("layer4.weight", scalar(40.0));
        dict.insert("head.weight", scalar(9.0));

        assert_eq!(
            dict.keys().collect::<Vec<_>>(),
            vec![
                "layer0.weight",
                "layer2.weight",
                "layer4.weight",
                "layer5.weight",
                "head.weight"
            ]
        );
        for (key, expected) in [
            ("layer0.weight", 0.0),
            ("layer2.weight", 2.0),
            ("layer4.weight", 40.0),
            ("layer5.weight", 5.0),
            ("head.weight", 9.0),
        ] {
            assert_eq!(dict.get(key).unwrap().to_scalar::<f32>().unwrap(), expected);
        }
        assert!(!dict.contains_key("layer3.weight"));
        assert_eq!(dict.len(), 5);
    }

    #[test]
    fn take_removes_field() {
        let mut inputs = BatchInputs::new()
            .with_field(BatchInputs::LABELS, scalar(1.0))
            .with_field(BatchInputs::SENSOR_VALUES, scalar(0.5));

        assert!(inputs.take(BatchInputs::LABELS).is_some());
        assert!(!inputs.contains(BatchInputs::LABELS));
        assert_eq!(inputs.len(), 1);
    }
}
