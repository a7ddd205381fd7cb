use frame_proto::TabInfo;
use serde_json::{Map, Value};

/// Local mirror of the peer's tab strip.
///
/// Identity is the tab id; `index` is always rewritten to the entry's
/// position after a mutation.
#[derive(Debug, Default, Clone)]
pub struct TabCache {
    entries: Vec<TabInfo>,
}

impl TabCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<TabInfo> {
        self.entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<&TabInfo> {
        self.entries.iter().find(|tab| tab.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|tab| tab.id == id)
    }

    /// Inserts at `index_hint` when given (clamped to the current length),
    /// else appends. A tab already known under the same id is replaced.
    pub fn insert(&mut self, tab: TabInfo, index_hint: Option<i64>) {
        if let Some(existing) = self.position(&tab.id) {
            self.entries.remove(existing);
        }
        let at = match index_hint {
            Some(hint) => hint.clamp(0, self.entries.len() as i64) as usize,
            None => self.entries.len(),
        };
        self.entries.insert(at, tab);
        self.reindex();
    }

    /// Merges `patch` into the tab with `id`. The tab keeps its position unless
    /// `index_hint` moves it; unknown ids are appended.
    pub fn update(&mut self, id: &str, patch: &Map<String, Value>, index_hint: Option<i64>) {
        let Some(position) = self.position(id) else {
            let mut fields = patch.clone();
            fields.insert("id".into(), Value::String(id.to_string()));
            if let Some(tab) = TabInfo::from_map(&fields) {
                self.insert(tab, index_hint);
            }
            return;
        };
        self.entries[position].merge(patch);
        if let Some(hint) = index_hint {
            let tab = self.entries.remove(position);
            let at = hint.clamp(0, self.entries.len() as i64) as usize;
            self.entries.insert(at, tab);
        }
        self.reindex();
    }

    pub fn remove(&mut self, id: &str) -> Option<TabInfo> {
        let position = self.position(id)?;
        let removed = self.entries.remove(position);
        self.reindex();
        Some(removed)
    }

    /// Replaces the whole mirror with an authoritative listing.
    pub fn replace_all(&mut self, tabs: Vec<TabInfo>) {
        self.entries = tabs;
        self.reindex();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn reindex(&mut self) {
        for (position, tab) in self.entries.iter_mut().enumerate() {
            tab.index = position;
        }
    }
}
