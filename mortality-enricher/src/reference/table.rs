use std::collections::HashMap;

use crate::date::NormalizedDate;

/// Composite join key: month, category and setting.
///
/// Category and setting are trimmed on construction and compared
/// case-sensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinKey {
    date: NormalizedDate,
    category: String,
    setting: String,
}

impl JoinKey {
    pub fn new(date: NormalizedDate, category: &str, setting: &str) -> Self {
        Self {
            date,
            category: category.trim().to_string(),
            setting: setting.trim().to_string(),
        }
    }

    pub fn date(&self) -> NormalizedDate {
        self.date
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn setting(&self) -> &str {
        &self.setting
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRow {
    pub date: NormalizedDate,
    pub category: String,
    pub setting: String,
    pub system: String,
    pub facility_name: String,
    pub count: i64,
}

impl ReferenceRow {
    pub fn key(&self) -> JoinKey {
        JoinKey::new(self.date, &self.category, &self.setting)
    }
}

/// One reference table indexed by [`JoinKey`]. Rows sharing a key keep the
/// order in which they appeared in the source file.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    name: String,
    rows: HashMap<JoinKey, Vec<ReferenceRow>>,
    row_count: usize,
}

impl ReferenceTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: HashMap::new(),
            row_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&mut self, row: ReferenceRow) {
        self.rows.entry(row.key()).or_default().push(row);
        self.row_count += 1;
    }

    /// All rows matching `key`, in file order. Empty on a miss.
    pub fn lookup(&self, key: &JoinKey) -> &[ReferenceRow] {
        self.rows.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn key_count(&self) -> usize {
        self.rows.len()
    }
}

impl FromIterator<ReferenceRow> for ReferenceTable {
    fn from_iter<I: IntoIterator<Item = ReferenceRow>>(iter: I) -> Self {
        let mut table = ReferenceTable::default();
        for row in iter {
            table.insert(row);
        }
        table
    }
}

/// The pair of tables a micro-batch is joined against.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    /// Hospital data / diagnosis type table, source of `count2`
    pub hospital: ReferenceTable,
    /// Health category table, source of `count3`
    pub health_category: ReferenceTable,
}

impl ReferenceData {
    pub fn new(hospital: ReferenceTable, health_category: ReferenceTable) -> Self {
        Self {
            hospital,
            health_category,
        }
    }
}
