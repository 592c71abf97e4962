use std::collections::HashMap;

use crate::model::StateRow;

/// Run-scoped state-code dictionary, owned by the orchestrator: seeded from
/// the persisted states table at startup, grown in memory as new codes are
/// seen, and fully rewritten at the end of the run. Ids stay stable across
/// runs only because the persisted table is reloaded first.
#[derive(Debug, Default)]
pub struct StateDictionary {
    by_code: HashMap<String, (u32, Option<String>)>,
}

impl StateDictionary {
    pub fn from_rows(rows: Vec<StateRow>) -> Self {
        let mut by_code = HashMap::new();
        for row in rows {
            by_code.insert(row.state_code, (row.state_id, row.state_name));
        }
        Self { by_code }
    }

    /// Existing id for a code, or the next sequential id (`len + 1`) on
    /// first sight. New codes carry no name.
    pub fn get_or_create(&mut self, state_code: &str) -> u32 {
        let code = state_code.trim();
        if let Some((id, _)) = self.by_code.get(code) {
            return *id;
        }
        let id = self.by_code.len() as u32 + 1;
        self.by_code.insert(code.to_string(), (id, None));
        id
    }

    pub fn code_for(&self, state_id: u32) -> Option<&str> {
        self.by_code
            .iter()
            .find(|(_, (id, _))| *id == state_id)
            .map(|(code, _)| code.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Full dictionary ordered by id, ready to be rewritten to the store.
    pub fn rows(&self) -> Vec<StateRow> {
        let mut rows: Vec<StateRow> = self
            .by_code
            .iter()
            .map(|(code, (id, name))| StateRow {
                state_id: *id,
                state_code: code.clone(),
                state_name: name.clone(),
            })
            .collect();
        rows.sort_by_key(|row| row.state_id);
        rows
    }
}
