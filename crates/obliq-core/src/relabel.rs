//! Value relabeling.
//!
//! The engine only understands small fixed-width integers, so every stage
//! input is rewritten through a [`ValueRelabeler`] that hands out dense ids
//! in first-seen order. The resulting [`ValueMap`] is persisted next to the
//! stage input and read back as a [`ReverseMap`] once the engine is done.
//!
//! A relabeler lives for exactly one stage. Nothing here is global.

use indexmap::IndexMap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Prefix written in place of ids that have no entry in the map.
pub const UNMAPPED_PREFIX: &str = "UNMAPPED_";

/// Separator between id and value in a map file.
const MAP_SEPARATOR: char = '|';

/// Errors produced while relabeling or loading a map.
#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("map line {line}: malformed entry '{entry}'")]
    MalformedMapEntry { line: usize, entry: String },
}

/// Forward mapping from original values to dense ids.
///
/// Ids are the insertion index, so they always form `[0, len)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueMap {
    ids: IndexMap<String, u64>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `value`, assigning the next one if unseen.
    pub fn intern(&mut self, value: &str) -> u64 {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = self.ids.len() as u64;
        self.ids.insert(value.to_string(), id);
        id
    }

    /// Look up the id of an already-seen value.
    pub fn get(&self, value: &str) -> Option<u64> {
        self.ids.get(value).copied()
    }

    /// Look up the value behind an id.
    pub fn value(&self, id: u64) -> Option<&str> {
        let index = usize::try_from(id).ok()?;
        self.ids.get_index(index).map(|(value, _)| value.as_str())
    }

    /// The id the next unseen value would receive.
    pub fn next_id(&self) -> u64 {
        self.ids.len() as u64
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.ids.iter().map(|(value, &id)| (id, value.as_str()))
    }

    /// Write the map as `id|value` lines.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), RelabelError> {
        for (id, value) in self.iter() {
            writeln!(writer, "{id}{MAP_SEPARATOR}{}", escape(value))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Persist the map to `path`.
    pub fn save(&self, path: &Path) -> Result<(), RelabelError> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))
    }
}

/// Inverse lookup from id to original value, as consumed by reverse relabeling.
#[derive(Debug, Clone, Default)]
pub struct ReverseMap {
    values: HashMap<u64, String>,
}

impl ReverseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `id|value` lines. Blank lines are ignored.
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, RelabelError> {
        let mut values = HashMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let malformed = || RelabelError::MalformedMapEntry {
                line: index + 1,
                entry: line.clone(),
            };
            let (id, value) = line.split_once(MAP_SEPARATOR).ok_or_else(malformed)?;
            let id: u64 = id.trim().parse().map_err(|_| malformed())?;
            let value = unescape(value).ok_or_else(malformed)?;
            values.insert(id, value);
        }
        Ok(Self { values })
    }

    /// Load a map file written by [`ValueMap::save`].
    pub fn load(path: &Path) -> Result<Self, RelabelError> {
        let file = File::open(path)?;
        Self::parse(BufReader::new(file))
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.values.get(&id).map(String::as_str)
    }

    /// Resolve a raw engine token.
    ///
    /// Integers found in the map become their original value; integers that
    /// are missing become `UNMAPPED_<id>`. Anything that is not an id at all
    /// is returned untouched.
    pub fn resolve<'a>(&'a self, token: &'a str) -> Resolved<'a> {
        match token.parse::<u64>() {
            Ok(id) => match self.get(id) {
                Some(value) => Resolved::Mapped(value),
                None => Resolved::Unmapped(format!("{UNMAPPED_PREFIX}{id}")),
            },
            Err(_) => Resolved::Verbatim(token),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<ValueMap> for ReverseMap {
    fn from(map: ValueMap) -> Self {
        map.ids.into_iter().map(|(value, id)| (id, value)).collect()
    }
}

impl FromIterator<(u64, String)> for ReverseMap {
    fn from_iter<I: IntoIterator<Item = (u64, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Outcome of resolving one engine token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<'a> {
    Mapped(&'a str),
    Unmapped(String),
    Verbatim(&'a str),
}

impl Resolved<'_> {
    pub fn is_unmapped(&self) -> bool {
        matches!(self, Resolved::Unmapped(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Resolved::Mapped(s) | Resolved::Verbatim(s) => s,
            Resolved::Unmapped(s) => s.as_str(),
        }
    }
}

/// What happens to a field position during relabeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Replace the value with its dense id.
    Relabel,
    /// Keep the value as is. It is still recorded in the map.
    Passthrough,
}

/// How rows with the wrong number of fields are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strictness {
    /// Copy the row through unchanged and log a warning.
    #[default]
    Permissive,
    /// Abort with [`RelabelError::MalformedRow`].
    Strict,
}

/// Counters from [`ValueRelabeler::relabel_stream`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelabelStats {
    pub rows: usize,
    pub passed_through: usize,
}

/// Stage-scoped relabeler.
#[derive(Debug, Clone)]
pub struct ValueRelabeler {
    roles: Vec<FieldRole>,
    strictness: Strictness,
    map: ValueMap,
}

impl ValueRelabeler {
    /// Create a relabeler for rows with one field per role.
    pub fn new(roles: impl Into<Vec<FieldRole>>) -> Self {
        Self {
            roles: roles.into(),
            strictness: Strictness::default(),
            map: ValueMap::new(),
        }
    }

    /// Set how malformed rows are handled.
    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn roles(&self) -> &[FieldRole] {
        &self.roles
    }

    pub fn map(&self) -> &ValueMap {
        &self.map
    }

    /// Pre-assign ids in the given order.
    ///
    /// Used when the engine orders rows by id and the ids must therefore
    /// follow the lexicographic order of the values.
    pub fn seed_ordered<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for value in values {
            self.map.intern(value.as_ref());
        }
    }

    /// Relabel one row. Returns `None` if the arity does not match.
    pub fn relabel_fields(&mut self, fields: &[&str]) -> Option<Vec<String>> {
        if fields.len() != self.roles.len() {
            return None;
        }
        let row = fields
            .iter()
            .zip(&self.roles)
            .map(|(field, role)| {
                let id = self.map.intern(field);
                match role {
                    FieldRole::Relabel => id.to_string(),
                    FieldRole::Passthrough => (*field).to_string(),
                }
            })
            .collect();
        Some(row)
    }

    /// Relabel an engine-format text stream.
    ///
    /// The first line is the count header and is copied verbatim. Fields are
    /// separated by single spaces; the last field absorbs any extra spaces.
    pub fn relabel_stream<R: BufRead, W: Write>(
        &mut self,
        reader: R,
        mut writer: W,
    ) -> Result<RelabelStats, RelabelError> {
        let mut stats = RelabelStats::default();
        let arity = self.roles.len();
        let mut lines = reader.lines();

        if let Some(header) = lines.next() {
            writeln!(writer, "{}", header?)?;
        }

        for (index, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.splitn(arity, ' ').collect();
            match self.relabel_fields(&fields) {
                Some(row) => {
                    writeln!(writer, "{}", row.join(" "))?;
                    stats.rows += 1;
                }
                None => {
                    // +2: one for the header, one for 1-based numbering
                    let line_no = index + 2;
                    match self.strictness {
                        Strictness::Strict => {
                            return Err(RelabelError::MalformedRow {
                                line: line_no,
                                expected: arity,
                                found: fields.len(),
                            });
                        }
                        Strictness::Permissive => {
                            tracing::warn!(
                                line = line_no,
                                expected = arity,
                                found = fields.len(),
                                "passing malformed row through unchanged"
                            );
                            writeln!(writer, "{line}")?;
                            stats.passed_through += 1;
                        }
                    }
                }
            }
        }

        writer.flush()?;
        Ok(stats)
    }

    /// Finish the stage and hand over the map.
    pub fn into_map(self) -> ValueMap {
        self.map
    }
}

fn escape(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '\n', '\r']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn unescape(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Cursor;

    #[test]
    fn test_intern_first_seen_order() {
        let mut map = ValueMap::new();
        assert_eq!(map.intern("b"), 0);
        assert_eq!(map.intern("a"), 1);
        assert_eq!(map.intern("b"), 0);
        assert_eq!(map.next_id(), 2);
        assert_eq!(map.value(1), Some("a"));
        assert_eq!(map.value(2), None);
    }

    #[test]
    fn test_ids_are_dense() {
        let mut relabeler = ValueRelabeler::new([FieldRole::Relabel, FieldRole::Relabel]);
        let rows = [["x", "1"], ["y", "1"], ["x", "z"], ["w", "w"]];
        for row in rows {
            relabeler.relabel_fields(&row).unwrap();
        }
        let map = relabeler.into_map();
        let distinct: HashSet<&str> = rows.iter().flatten().copied().collect();
        assert_eq!(map.len(), distinct.len());

        let ids: Vec<u64> = map.iter().map(|(id, _)| id).collect();
        let expected: Vec<u64> = (0..distinct.len() as u64).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_bijection_roundtrip_through_file() {
        let values = [
            "plain",
            "with space",
            "a,b,c",
            "pipe|inside",
            "back\\slash",
            "multi\nline",
            "",
        ];
        let mut map = ValueMap::new();
        for v in values {
            map.intern(v);
        }

        let mut buf = Vec::new();
        map.write_to(&mut buf).unwrap();
        let reverse = ReverseMap::parse(Cursor::new(buf)).unwrap();

        for v in values {
            let id = map.get(v).unwrap();
            let decoded = reverse.get(id).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(map.get(decoded), Some(id));
        }
    }

    #[test]
    fn test_passthrough_still_recorded() {
        let mut relabeler = ValueRelabeler::new([FieldRole::Passthrough, FieldRole::Relabel]);
        let row = relabeler.relabel_fields(&["42", "apple"]).unwrap();
        assert_eq!(row, vec!["42".to_string(), "1".to_string()]);
        assert_eq!(relabeler.map().get("42"), Some(0));
    }

    #[test]
    fn test_seed_ordered_preserves_order() {
        let mut relabeler =
            ValueRelabeler::new([FieldRole::Relabel, FieldRole::Passthrough, FieldRole::Relabel]);
        relabeler.seed_ordered(["aa", "bb", "cc"]);
        let row = relabeler.relabel_fields(&["cc", "1", "p"]).unwrap();
        assert_eq!(row[0], "2");
        assert_eq!(row[2], "4");
    }

    #[test]
    fn test_stream_copies_header_and_relabels() {
        let input = "2 1\nalice x\nbob y\nalice z\n";
        let mut out = Vec::new();
        let mut relabeler = ValueRelabeler::new([FieldRole::Relabel, FieldRole::Relabel]);
        let stats = relabeler
            .relabel_stream(Cursor::new(input), &mut out)
            .unwrap();

        assert_eq!(stats.rows, 3);
        assert_eq!(String::from_utf8(out).unwrap(), "2 1\n0 1\n2 3\n0 4\n");
    }

    #[test]
    fn test_stream_last_field_keeps_spaces() {
        let input = "1 0\nk hello world\n";
        let mut out = Vec::new();
        let mut relabeler = ValueRelabeler::new([FieldRole::Relabel, FieldRole::Relabel]);
        relabeler
            .relabel_stream(Cursor::new(input), &mut out)
            .unwrap();
        assert_eq!(relabeler.map().get("hello world"), Some(1));
    }

    #[test]
    fn test_stream_permissive_passes_malformed() {
        let input = "2 0\nonlyone\na b\n";
        let mut out = Vec::new();
        let mut relabeler = ValueRelabeler::new([FieldRole::Relabel, FieldRole::Relabel]);
        let stats = relabeler
            .relabel_stream(Cursor::new(input), &mut out)
            .unwrap();

        assert_eq!(stats.passed_through, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "2 0\nonlyone\n0 1\n");
    }

    #[test]
    fn test_stream_strict_rejects_malformed() {
        let input = "1 0\nonlyone\n";
        let mut relabeler = ValueRelabeler::new([FieldRole::Relabel, FieldRole::Relabel])
            .strictness(Strictness::Strict);
        let err = relabeler
            .relabel_stream(Cursor::new(input), Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            RelabelError::MalformedRow {
                line: 2,
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_resolve_tokens() {
        let reverse: ReverseMap = [(0, "K".to_string())].into_iter().collect();
        assert_eq!(reverse.resolve("0"), Resolved::Mapped("K"));
        assert_eq!(reverse.resolve("9"), Resolved::Unmapped("UNMAPPED_9".into()));
        assert_eq!(reverse.resolve("abc"), Resolved::Verbatim("abc"));
    }

    #[test]
    fn test_malformed_map_entry() {
        let err = ReverseMap::parse(Cursor::new("0|ok\nnot-an-entry\n")).unwrap_err();
        assert!(matches!(err, RelabelError::MalformedMapEntry { line: 2, .. }));
    }
}
