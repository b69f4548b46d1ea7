//! CLI Response Parser
//!
//! Turns the array's delimited text output into records. Two layouts exist:
//!
//! - **table**: a header line followed by rows, each split by the delimiter
//! - **record**: `key!value` lines grouped into blank-line separated blocks
//!
//! The parser only validates shape. Whether a field is present is the
//! caller's concern.

use indexmap::IndexMap;
use serde::Serialize;

// =============================================================================
// Field Values
// =============================================================================

/// Value of one field; keys repeated within a record block accumulate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Single(String),
    Multi(Vec<String>),
}

impl FieldValue {
    /// First (or only) value
    pub fn first(&self) -> &str {
        match self {
            FieldValue::Single(v) => v,
            FieldValue::Multi(vs) => vs.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values in output order
    pub fn values(&self) -> Vec<&str> {
        match self {
            FieldValue::Single(v) => vec![v.as_str()],
            FieldValue::Multi(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            FieldValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = FieldValue::Multi(vec![first, value]);
            }
            FieldValue::Multi(vs) => vs.push(value),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// One object from the array's output, fields in output order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, accumulating repeated keys into a list
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.fields.get_mut(&key) {
            Some(existing) => existing.push(value),
            None => {
                self.fields.insert(key, FieldValue::Single(value));
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// First value of a field
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(FieldValue::first)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

/// Ordered set of records parsed from one command's output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn into_first(self) -> Option<Record> {
        self.records.into_iter().next()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Yield, per record, the values of `keys` in record order.
    ///
    /// Multi-valued fields project their first value. Calling this again
    /// restarts from the first record.
    pub fn project<'a>(&'a self, keys: &'a [&'a str]) -> Projection<'a> {
        Projection {
            records: self.records.iter(),
            keys,
        }
    }

    /// Single-key projection
    pub fn project_one<'a>(&'a self, key: &'a str) -> impl Iterator<Item = Option<&'a str>> + 'a {
        self.records.iter().map(move |r| r.get_str(key))
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Lazy column projection over a [`RecordSet`]
pub struct Projection<'a> {
    records: std::slice::Iter<'a, Record>,
    keys: &'a [&'a str],
}

impl<'a> Iterator for Projection<'a> {
    type Item = Vec<Option<&'a str>>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(self.keys.iter().map(|k| record.get_str(k)).collect())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Output layout of a CLI command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Header line followed by delimited rows
    Table,
    /// `key<delim>value` lines, blank-line separated blocks
    Record,
}

/// Output did not have the expected shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeError {
    /// 1-based line number in the raw output
    pub line: usize,
    pub expected: usize,
    pub found: usize,
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {} has {} fields, header has {}",
            self.line, self.found, self.expected
        )
    }
}

impl ShapeError {
    /// Attach the command that produced the output
    pub fn into_error(self, command: &str) -> crate::error::Error {
        crate::error::Error::ProtocolMismatch {
            command: command.to_string(),
            detail: self.to_string(),
        }
    }
}

/// Parse raw CLI output
pub fn parse(raw: &str, delimiter: char, layout: Layout) -> Result<RecordSet, ShapeError> {
    match layout {
        Layout::Table => parse_table(raw, delimiter),
        Layout::Record => Ok(parse_records(raw, delimiter)),
    }
}

fn lines(raw: &str) -> impl Iterator<Item = (usize, &str)> {
    raw.lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
}

fn parse_table(raw: &str, delimiter: char) -> Result<RecordSet, ShapeError> {
    let mut rows = lines(raw).filter(|(_, l)| !l.trim().is_empty());

    let header: Vec<&str> = match rows.next() {
        Some((_, line)) => line.split(delimiter).map(str::trim).collect(),
        None => return Ok(RecordSet::default()),
    };

    let mut records = Vec::new();
    for (lineno, line) in rows {
        let values: Vec<&str> = line.split(delimiter).collect();
        if values.len() != header.len() {
            return Err(ShapeError {
                line: lineno,
                expected: header.len(),
                found: values.len(),
            });
        }
        records.push(header.iter().copied().zip(values).collect());
    }

    Ok(RecordSet::new(records))
}

fn parse_records(raw: &str, delimiter: char) -> RecordSet {
    let mut records = Vec::new();
    let mut current = Record::new();

    for (_, line) in lines(raw) {
        if line.trim().is_empty() {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        let (key, value) = line.split_once(delimiter).unwrap_or((line, ""));
        current.insert(key.trim(), value);
    }
    if !current.is_empty() {
        records.push(current);
    }

    RecordSet::new(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSVDISK_TABLE: &str = "id!name!capacity!mdisk_grp_name\n\
                                 0!vol-a!10737418240!pool0\n\
                                 1!vol-b!21474836480!pool0\n";

    #[test]
    fn test_table_rows_match_header_positionally() {
        let set = parse(LSVDISK_TABLE, '!', Layout::Table).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(0).unwrap().get_str("name"), Some("vol-a"));
        assert_eq!(set.get(1).unwrap().get_str("capacity"), Some("21474836480"));
        assert_eq!(set.get(1).unwrap().get_str("mdisk_grp_name"), Some("pool0"));
    }

    #[test]
    fn test_table_width_mismatch_is_rejected() {
        let raw = "id!name!status\n0!map0!copying\n1!map1\n";
        let err = parse(raw, '!', Layout::Table).unwrap_err();
        assert_eq!(
            err,
            ShapeError {
                line: 3,
                expected: 3,
                found: 2
            }
        );

        let raw = "id!name\n0!a!extra\n";
        assert!(parse(raw, '!', Layout::Table).is_err());
    }

    #[test]
    fn test_table_header_only_and_empty() {
        assert!(parse("id!name\n", '!', Layout::Table).unwrap().is_empty());
        assert!(parse("", '!', Layout::Table).unwrap().is_empty());
        assert!(parse("\n\n", '!', Layout::Record).unwrap().is_empty());
    }

    #[test]
    fn test_record_blocks_and_repeated_keys() {
        let raw = "id!2\nname!host-1\nWWPN!10000090FA0D1234\nWWPN!10000090FA0D5678\n\n\
                   id!3\nname!host-2\niscsi_name!iqn.1994-05.com.redhat:abc\n";
        let set = parse(raw, '!', Layout::Record).unwrap();
        assert_eq!(set.len(), 2);

        let first = set.first().unwrap();
        assert_eq!(first.get_str("name"), Some("host-1"));
        assert_eq!(
            first.get("WWPN").unwrap().values(),
            vec!["10000090FA0D1234", "10000090FA0D5678"]
        );
        assert_eq!(set.get(1).unwrap().get_str("iscsi_name"), Some("iqn.1994-05.com.redhat:abc"));
    }

    #[test]
    fn test_records_serialize_in_output_order() {
        let raw = "name!host-1\nid!2\nWWPN!A1\nWWPN!B2\n";
        let set = parse(raw, '!', Layout::Record).unwrap();
        assert_eq!(
            serde_json::to_string(&set).unwrap(),
            r#"[{"name":"host-1","id":"2","WWPN":["A1","B2"]}]"#
        );
    }

    #[test]
    fn test_record_value_keeps_embedded_delimiters() {
        let raw = "name!vol!with!bangs\nempty_field\n";
        let record = parse(raw, '!', Layout::Record).unwrap().into_first().unwrap();
        assert_eq!(record.get_str("name"), Some("vol!with!bangs"));
        assert_eq!(record.get_str("empty_field"), Some(""));
    }

    #[test]
    fn test_projection_is_ordered_and_restartable() {
        let set = parse(LSVDISK_TABLE, '!', Layout::Table).unwrap();
        let keys = ["id", "name", "missing"];

        let rows: Vec<_> = set.project(&keys).collect();
        assert_eq!(
            rows,
            vec![
                vec![Some("0"), Some("vol-a"), None],
                vec![Some("1"), Some("vol-b"), None],
            ]
        );
        assert_eq!(set.project(&keys).count(), 2);

        let names: Vec<_> = set.project_one("name").flatten().collect();
        assert_eq!(names, vec!["vol-a", "vol-b"]);
    }

    #[test]
    fn test_crlf_output() {
        let raw = "id!name\r\n7!vol-x\r\n";
        let set = parse(raw, '!', Layout::Table).unwrap();
        assert_eq!(set.first().unwrap().get_str("name"), Some("vol-x"));
    }
}
