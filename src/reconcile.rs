use crate::data::{DisplayRow, ProcessEntry};
use crate::format::format_memory;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Changes that bring a displayed process table in line with a new sample.
///
/// Removals are applied before insertions: a reused pid shows up in both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EditScript {
    pub remove: BTreeSet<u32>,
    pub update: BTreeMap<u32, String>,
    pub insert: Vec<DisplayRow>,
}

impl EditScript {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.update.is_empty() && self.insert.is_empty()
    }
}

/// Diffs the displayed rows against freshly sampled processes.
///
/// A row survives only if the sample has the same pid with the same command
/// line; anything else is a different process and the row is dropped, so a
/// selection never carries over to a recycled pid. Duplicate pids in
/// `sampled` resolve to the last entry.
pub fn reconcile(existing: &[DisplayRow], sampled: &[ProcessEntry]) -> EditScript {
    let mut by_pid: HashMap<u32, usize> = HashMap::with_capacity(sampled.len());
    for (index, entry) in sampled.iter().enumerate() {
        by_pid.insert(entry.pid, index);
    }

    let mut script = EditScript::default();
    let mut consumed = HashSet::new();

    for row in existing {
        match by_pid.get(&row.pid).map(|&index| &sampled[index]) {
            Some(entry) if entry.cmdline == row.cmdline => {
                script
                    .update
                    .insert(row.pid, format_memory(entry.memory_used, None));
                consumed.insert(row.pid);
            }
            _ => {
                script.remove.insert(row.pid);
            }
        }
    }

    script.insert = sampled
        .iter()
        .enumerate()
        .filter(|(index, entry)| by_pid[&entry.pid] == *index && !consumed.contains(&entry.pid))
        .map(|(_, entry)| DisplayRow {
            pid: entry.pid,
            memory: format_memory(entry.memory_used, None),
            cmdline: entry.cmdline.clone(),
            selected: false,
        })
        .collect();

    script
}

// Owned process list; the render loop is its only writer
#[derive(Clone, Debug, Default)]
pub struct ProcessTable {
    rows: Vec<DisplayRow>,
}

impl ProcessTable {
    pub fn rows(&self) -> &[DisplayRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn sync(&mut self, sampled: &[ProcessEntry]) {
        let script = reconcile(&self.rows, sampled);
        if !script.is_empty() {
            self.apply(script);
        }
    }

    pub fn apply(&mut self, script: EditScript) {
        let EditScript {
            remove,
            mut update,
            insert,
        } = script;

        self.rows.retain(|row| !remove.contains(&row.pid));
        for row in &mut self.rows {
            if let Some(memory) = update.remove(&row.pid) {
                row.memory = memory;
            }
        }
        for row in insert {
            // keep one row per pid even if the script was built from stale rows
            self.rows.retain(|existing| existing.pid != row.pid);
            self.rows.push(row);
        }
    }

    pub fn toggle(&mut self, pid: u32) {
        if let Some(row) = self.rows.iter_mut().find(|row| row.pid == pid) {
            row.selected = !row.selected;
        }
    }

    /// Selects every row, or clears the selection when all rows are selected.
    pub fn toggle_all(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        let select = !self.rows.iter().all(|row| row.selected);
        for row in &mut self.rows {
            row.selected = select;
        }
    }

    pub fn selected_pids(&self) -> Vec<u32> {
        self.rows
            .iter()
            .filter(|row| row.selected)
            .map(|row| row.pid)
            .collect()
    }
}
