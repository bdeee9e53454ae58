//! Bin framing: large taskdata/subset/subtask payloads are stored as
//! fixed-size chunks so both backends share one chunk/unchunk contract.
//!
//! Bins exist to work around DynamoDB's small batch limits; a size of 500
//! also keeps per-partition update rates under throttling thresholds. The
//! SQLite backend uses the same layout so records stay portable.

use serde_json::Value;

/// Number of elements per bin.
pub const BIN_SIZE: usize = 500;

/// The three bin families a task may own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinKind {
    Taskdata,
    Subset,
    Subtask,
}

impl BinKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            BinKind::Taskdata => "TASKDATABIN",
            BinKind::Subset => "SUBSETBIN",
            BinKind::Subtask => "SUBTASKBIN",
        }
    }

    /// Name of the `TaskState` counter column tracking this family.
    pub fn count_field(&self) -> &'static str {
        match self {
            BinKind::Taskdata => "taskdata_count",
            BinKind::Subset => "subset_count",
            BinKind::Subtask => "subtask_count",
        }
    }
}

impl std::fmt::Display for BinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Bin ids covering `count` elements: `"0"..="N"` where
/// `N = ceil(count / BIN_SIZE) - 1`, or just `"0"` when the count is zero.
pub fn bin_ids_for(count: usize) -> Vec<String> {
    if count == 0 {
        return vec!["0".to_string()];
    }
    let bins = count.div_ceil(BIN_SIZE);
    (0..bins).map(|i| i.to_string()).collect()
}

/// `(bin_id, offset)` addressing for a global element index.
pub fn bin_location(index: usize) -> (String, usize) {
    ((index / BIN_SIZE).to_string(), index % BIN_SIZE)
}

/// Chunk a list payload into `(bin_id, chunk)` pairs.
pub fn chunk_list(items: &[Value]) -> Vec<(String, &[Value])> {
    if items.is_empty() {
        return Vec::new();
    }
    items
        .chunks(BIN_SIZE)
        .enumerate()
        .map(|(i, chunk)| (i.to_string(), chunk))
        .collect()
}

/// Chunk an ordered key list into `(bin_id, subtask chunk)` pairs, assigning
/// each element its global index.
pub fn chunk_subtask_keys(keys: &[String]) -> Vec<(String, Vec<crate::Subtask>)> {
    keys.chunks(BIN_SIZE)
        .enumerate()
        .map(|(bin_index, chunk)| {
            let base = bin_index * BIN_SIZE;
            let subtasks = chunk
                .iter()
                .enumerate()
                .map(|(offset, key)| crate::Subtask::new(base + offset, key.clone()))
                .collect();
            (bin_index.to_string(), subtasks)
        })
        .collect()
}
