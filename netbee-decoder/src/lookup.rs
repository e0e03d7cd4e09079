//! Run-time lookup tables: exact-match and masked-match associative
//! stores with per-row lifetimes.

use std::collections::HashMap;

use itertools::izip;
use netbee_expr::ColumnKind;
use netbee_protodb::{Column, EntryPolicy, NodeData, ProtocolDatabase};
use tracing::trace;

use crate::eval::{EvalError, Value};

/// How long an inserted row stays visible.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifetime {
    Forever,
    /// Absolute expiry, in packet-timestamp seconds.
    Until(u64),
}

#[derive(Debug, Clone)]
struct Row {
    id: u64,
    data: Vec<Value>,
    inserted: u64,
    lifetime: Lifetime,
    obsolete: bool,
}

impl Row {
    fn live(&self, now: u64) -> bool {
        if self.obsolete {
            return false;
        }
        match self.lifetime {
            Lifetime::Forever => true,
            Lifetime::Until(t) => now < t,
        }
    }
}

#[derive(Debug)]
struct MaskedRow {
    key: Vec<u8>,
    masks: Vec<Option<Vec<u8>>>,
    row: Row,
}

#[derive(Debug)]
pub struct Table {
    name: String,
    exact_capacity: usize,
    masked_capacity: usize,
    dynamic: bool,
    key_cols: Vec<Column>,
    data_cols: Vec<Column>,
    /// Rows per key tuple, newest first; add-on-hit stacks rows under
    /// one key the same way the masked list stacks whole entries.
    exact: HashMap<Vec<u8>, Vec<Row>>,
    /// Checked linearly in insertion order; newest first.
    masked: Vec<MaskedRow>,
    /// Data columns of the last successful check, readable as
    /// `table.column` until the next check.
    bound: Option<Row>,
    next_row_id: u64,
}

/// Normalize one key value to its column's fixed width so tuples hash
/// and compare byte-wise.
fn normalize(column: &Column, value: &Value) -> Vec<u8> {
    let width = match column.kind {
        ColumnKind::Number | ColumnKind::Protocol => 4,
        ColumnKind::Buffer => column.size as usize,
    };
    let mut out = vec![0u8; width];
    match value {
        Value::Number(n) => out.copy_from_slice(&n.to_be_bytes()),
        Value::Boolean(b) => out[width - 1] = *b as u8,
        Value::Bytes(bytes) => {
            let n = bytes.len().min(width);
            out[..n].copy_from_slice(&bytes[..n]);
        }
    }
    out
}

impl Table {
    fn compose_key(&self, keys: &[Value]) -> Result<Vec<u8>, EvalError> {
        if keys.len() != self.key_cols.len() {
            return Err(EvalError::KeyArity {
                table: self.name.clone(),
                expected: self.key_cols.len(),
                given: keys.len(),
            });
        }
        let mut out = Vec::new();
        for (column, value) in self.key_cols.iter().zip(keys) {
            out.extend_from_slice(&normalize(column, value));
        }
        Ok(out)
    }

    /// Per-column masks laid out parallel to the composed key.
    fn compose_masks(&self, masks: &[Option<Vec<u8>>]) -> Vec<Option<Vec<u8>>> {
        self.key_cols
            .iter()
            .enumerate()
            .map(|(i, column)| {
                masks.get(i).and_then(|m| m.as_ref()).map(|mask| {
                    let width = match column.kind {
                        ColumnKind::Number | ColumnKind::Protocol => 4,
                        ColumnKind::Buffer => column.size as usize,
                    };
                    let mut out = vec![0xFFu8; width];
                    let n = mask.len().min(width);
                    out[..n].copy_from_slice(&mask[..n]);
                    out
                })
            })
            .collect()
    }

    fn masked_matches(&self, entry: &MaskedRow, probe: &[u8]) -> bool {
        if entry.key.len() != probe.len() {
            return false;
        }
        let mut offset = 0;
        for (column, mask) in self.key_cols.iter().zip(&entry.masks) {
            let width = match column.kind {
                ColumnKind::Number | ColumnKind::Protocol => 4,
                ColumnKind::Buffer => column.size as usize,
            };
            let stored = &entry.key[offset..offset + width];
            let probed = &probe[offset..offset + width];
            let ok = match mask {
                None => stored == probed,
                Some(mask) => izip!(stored, probed, mask).all(|(s, p, m)| s & m == p & m),
            };
            if !ok {
                return false;
            }
            offset += width;
        }
        true
    }

    fn evict_expired(&mut self, now: u64) {
        self.exact.retain(|_, rows| {
            rows.retain(|row| row.live(now));
            !rows.is_empty()
        });
        self.masked.retain(|entry| entry.row.live(now));
    }

    fn exact_len(&self) -> usize {
        self.exact.values().map(Vec::len).sum()
    }

    /// Room for one more exact row, evicting dead rows under pressure.
    fn reserve_exact_slot(&mut self, now: u64) -> Result<(), EvalError> {
        if self.exact_len() >= self.exact_capacity {
            self.evict_expired(now);
            if self.exact_len() >= self.exact_capacity {
                return Err(EvalError::TableFull(self.name.clone()));
            }
        }
        Ok(())
    }

    fn fresh_row(&mut self, data: Vec<Value>, now: u64, lifetime: Lifetime) -> Row {
        self.next_row_id += 1;
        Row {
            id: self.next_row_id,
            data,
            inserted: now,
            lifetime,
            obsolete: false,
        }
    }

    /// Insert or refresh one row per the entry policy.
    pub fn update(
        &mut self,
        keys: &[Value],
        masks: &[Option<Vec<u8>>],
        data: Vec<Value>,
        policy: EntryPolicy,
        keep_time: u32,
        hit_time: u32,
        new_hit_time: u32,
        now: u64,
    ) -> Result<(), EvalError> {
        if policy != EntryPolicy::KeepForever && !self.dynamic {
            return Err(EvalError::StaticTable(self.name.clone()));
        }

        let use_masks = masks.iter().any(Option::is_some);
        let base_lifetime = match policy {
            EntryPolicy::KeepForever => Lifetime::Forever,
            _ => Lifetime::Until(now + keep_time as u64),
        };

        if use_masks {
            let probe = self.compose_key(keys)?;
            let masks = self.compose_masks(masks);
            if self.masked.len() >= self.masked_capacity {
                self.evict_expired(now);
                if self.masked.len() >= self.masked_capacity {
                    return Err(EvalError::TableFull(self.name.clone()));
                }
            }
            let row = self.fresh_row(data, now, base_lifetime);
            // Newest entries are consulted first.
            self.masked.insert(0, MaskedRow { key: probe, masks, row });
            return Ok(());
        }

        let key = self.compose_key(keys)?;
        let hit = self
            .exact
            .get(&key)
            .map(|rows| rows.iter().any(|row| row.live(now)))
            .unwrap_or(false);

        match (hit, policy) {
            (true, EntryPolicy::UpdateOnHit) => {
                if let Some(row) = self
                    .exact
                    .get_mut(&key)
                    .and_then(|rows| rows.iter_mut().find(|row| row.live(now)))
                {
                    row.lifetime = Lifetime::Until(now + hit_time as u64);
                }
            }
            (true, EntryPolicy::ReplaceOnHit) => {
                // The hit row is overwritten in place.
                if let Some(row) = self
                    .exact
                    .get_mut(&key)
                    .and_then(|rows| rows.iter_mut().find(|row| row.live(now)))
                {
                    row.data = data;
                    row.lifetime = Lifetime::Until(now + new_hit_time as u64);
                }
            }
            (true, EntryPolicy::AddOnHit) => {
                // A hit adds another row for the key; the earlier one
                // stays until its own lifetime runs out.
                self.reserve_exact_slot(now)?;
                let row = self.fresh_row(data, now, Lifetime::Until(now + new_hit_time as u64));
                self.exact.entry(key).or_default().insert(0, row);
            }
            _ => {
                self.reserve_exact_slot(now)?;
                let row = self.fresh_row(data, now, base_lifetime);
                self.exact.entry(key).or_default().insert(0, row);
            }
        }
        Ok(())
    }

    /// Search for a live row; a hit binds its data columns for
    /// subsequent `table.column` reads.
    pub fn check(&mut self, keys: &[Value], now: u64) -> Result<bool, EvalError> {
        let probe = self.compose_key(keys)?;

        if let Some(rows) = self.exact.get(&probe) {
            if let Some(row) = rows.iter().find(|row| row.live(now)) {
                trace!(table = %self.name, "lookup hit (exact)");
                self.bound = Some(row.clone());
                return Ok(true);
            }
        }

        for entry in &self.masked {
            if entry.row.live(now) && self.masked_matches(entry, &probe) {
                trace!(table = %self.name, "lookup hit (masked)");
                self.bound = Some(entry.row.clone());
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Value of a column in the bound row. The engine-maintained
    /// `timestamp` and `lifetime` columns are always readable.
    pub fn bound_column(&self, column: &str) -> Result<Value, EvalError> {
        let row = self
            .bound
            .as_ref()
            .ok_or_else(|| EvalError::NoBoundRow(self.name.clone()))?;

        match column {
            "timestamp" => return Ok(Value::Number(row.inserted as u32)),
            "lifetime" => {
                let value = match row.lifetime {
                    Lifetime::Forever => 0,
                    Lifetime::Until(t) => t as u32,
                };
                return Ok(Value::Number(value));
            }
            _ => {}
        }

        self.data_cols
            .iter()
            .position(|c| c.name == column)
            .and_then(|i| row.data.get(i).cloned())
            .ok_or_else(|| EvalError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    /// Overwrite a column of the bound row, in place.
    pub fn write_bound_column(&mut self, column: &str, value: Value) -> Result<(), EvalError> {
        let row_id = self
            .bound
            .as_ref()
            .map(|row| row.id)
            .ok_or_else(|| EvalError::NoBoundRow(self.name.clone()))?;

        let index = self
            .data_cols
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| EvalError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })?;

        if let Some(bound) = &mut self.bound {
            bound.data[index] = value.clone();
        }
        for row in self.exact.values_mut().flatten() {
            if row.id == row_id {
                row.data[index] = value;
                return Ok(());
            }
        }
        for entry in &mut self.masked {
            if entry.row.id == row_id {
                entry.row.data[index] = value;
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn purge(&mut self) {
        self.exact.clear();
        self.masked.clear();
        self.bound = None;
    }

    /// Rows stay in place but stop matching.
    pub fn mark_obsolete(&mut self) {
        for row in self.exact.values_mut().flatten() {
            row.obsolete = true;
        }
        for entry in &mut self.masked {
            entry.row.obsolete = true;
        }
    }
}

/// All the lookup tables of one decoder instance.
#[derive(Debug, Default)]
pub struct LookupStore {
    tables: HashMap<String, Table>,
}

impl LookupStore {
    pub fn from_database(db: &ProtocolDatabase) -> Self {
        let mut tables = HashMap::new();
        for id in db.node_ids() {
            if let NodeData::LookupTable {
                name,
                exact_entries,
                mask_entries,
                dynamic_entries,
                keys,
                data,
            } = &db.node(id).data
            {
                tables.insert(
                    name.clone(),
                    Table {
                        name: name.clone(),
                        exact_capacity: *exact_entries as usize,
                        masked_capacity: *mask_entries as usize,
                        dynamic: *dynamic_entries,
                        key_cols: keys.clone(),
                        data_cols: data.clone(),
                        exact: HashMap::new(),
                        masked: Vec::new(),
                        bound: None,
                        next_row_id: 0,
                    },
                );
            }
        }
        LookupStore { tables }
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table, EvalError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| EvalError::UnknownTable(name.to_string()))
    }

    pub fn table(&self, name: &str) -> Result<&Table, EvalError> {
        self.tables
            .get(name)
            .ok_or_else(|| EvalError::UnknownTable(name.to_string()))
    }
}
