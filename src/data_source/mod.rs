// Data source module
//
// Per-call substitution rows read from a delimited text file. Rows are handed
// out through an atomic cursor, so any number of scheduler tasks can pull
// concurrently without a lock.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nom::{
    bytes::complete::take_till,
    character::complete::char,
    combinator::all_consuming,
    multi::separated_list1,
    IResult,
};

use crate::error::SipFlowError;

/// One record of per-call substitution data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRow {
    /// Position of the row in the source, starting at 0.
    pub index: usize,
    pub fields: Vec<String>,
}

impl VariableRow {
    pub fn field(&self, n: usize) -> Option<&str> {
        self.fields.get(n).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("data source exhausted")]
pub struct Exhausted;

/// Parsing options for delimited row files.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceOptions {
    pub delimiter: char,
    pub has_header: bool,
    pub cycling: bool,
}

impl Default for DataSourceOptions {
    fn default() -> Self {
        Self {
            delimiter: ';',
            has_header: false,
            cycling: false,
        }
    }
}

/// Ordering directives a SIPp injection file may open with.
const KNOWN_DIRECTIVES: &[&str] = &["SEQUENTIAL", "RANDOM", "RANDOM2", "USER", "USERS"];

pub struct DataSource {
    rows: Vec<Arc<VariableRow>>,
    cursor: AtomicUsize,
    cycling: bool,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("rows", &self.rows.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("cycling", &self.cycling)
            .finish()
    }
}

fn split_fields(line: &str, delimiter: char) -> IResult<&str, Vec<&str>> {
    all_consuming(separated_list1(
        char(delimiter),
        take_till(move |c: char| c == delimiter),
    ))(line)
}

impl DataSource {
    /// Build a source directly from rows of fields.
    pub fn from_rows(rows: Vec<Vec<String>>, cycling: bool) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(index, fields)| Arc::new(VariableRow { index, fields }))
            .collect();
        Self {
            rows,
            cursor: AtomicUsize::new(0),
            cycling,
        }
    }

    /// A single empty row that repeats forever, for runs without a data file.
    pub fn single_empty() -> Self {
        Self::from_rows(vec![Vec::new()], true)
    }

    /// Load and parse a delimited data file.
    pub fn load_from_file(path: &Path, options: &DataSourceOptions) -> Result<Self, SipFlowError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SipFlowError::DataParse(format!(
                "Failed to read data file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_str(&content, options)
    }

    /// Parse delimited rows.
    ///
    /// Blank lines and `#` comments are skipped. A leading `SEQUENTIAL`
    /// directive is accepted and ignored; any other ordering directive is an
    /// error. One trailing delimiter per line is tolerated.
    pub fn parse_str(content: &str, options: &DataSourceOptions) -> Result<Self, SipFlowError> {
        let mut header: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut seen_content = false;

        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            if !seen_content {
                seen_content = true;
                let word = line.trim();
                if KNOWN_DIRECTIVES.contains(&word) || word.starts_with("PRINTF") {
                    if word == "SEQUENTIAL" {
                        continue;
                    }
                    return Err(SipFlowError::DataParse(format!(
                        "line {}: unsupported ordering directive '{}'",
                        line_no + 1,
                        word
                    )));
                }
            }

            let line = line.strip_suffix(options.delimiter).unwrap_or(line);
            let (_, fields) = split_fields(line, options.delimiter).map_err(|e| {
                SipFlowError::DataParse(format!("line {}: {}", line_no + 1, e))
            })?;
            let fields: Vec<String> = fields.iter().map(|f| f.trim().to_string()).collect();

            if options.has_header && header.is_none() {
                header = Some(fields);
                continue;
            }
            if let Some(names) = &header {
                if fields.len() < names.len() {
                    return Err(SipFlowError::DataParse(format!(
                        "line {}: expected {} fields, found {}",
                        line_no + 1,
                        names.len(),
                        fields.len()
                    )));
                }
            }
            rows.push(fields);
        }

        Ok(Self::from_rows(rows, options.cycling))
    }

    /// Hand out the next row.
    ///
    /// Without cycling every row is returned at most once, then `Exhausted`.
    /// With cycling rows repeat in their original order.
    pub fn next(&self) -> Result<Arc<VariableRow>, Exhausted> {
        if self.rows.is_empty() {
            return Err(Exhausted);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        if self.cycling {
            return Ok(Arc::clone(&self.rows[idx % self.rows.len()]));
        }
        self.rows.get(idx).cloned().ok_or(Exhausted)
    }

    /// Field count of the shortest row; 0 for an empty source.
    pub fn min_row_width(&self) -> usize {
        self.rows.iter().map(|r| r.fields.len()).min().unwrap_or(0)
    }

    pub fn is_cycling(&self) -> bool {
        self.cycling
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    fn opts(cycling: bool) -> DataSourceOptions {
        DataSourceOptions {
            cycling,
            ..Default::default()
        }
    }

    // --- Unit tests: parsing ---

    #[test]
    fn test_parse_sipp_style_file() {
        let content = "SEQUENTIAL\n# users\nalice;10.0.0.1;\nbob;10.0.0.2;\n\n";
        let source = DataSource::parse_str(content, &opts(false)).unwrap();
        assert_eq!(source.len(), 2);
        let first = source.next().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.fields, vec!["alice", "10.0.0.1"]);
    }

    #[test]
    fn test_parse_rejects_other_directives() {
        let err = DataSource::parse_str("RANDOM\nalice;\n", &opts(false)).unwrap_err();
        match err {
            SipFlowError::DataParse(msg) => assert!(msg.contains("RANDOM"), "got: {}", msg),
            other => panic!("expected DataParse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_with_header_row() {
        let options = DataSourceOptions {
            delimiter: ',',
            has_header: true,
            cycling: false,
        };
        let source = DataSource::parse_str("user,domain\nalice,example.com\n", &options).unwrap();
        assert_eq!(source.len(), 1);
        assert_eq!(source.next().unwrap().field(0), Some("alice"));
    }

    #[test]
    fn test_parse_short_row_with_header_is_error() {
        let options = DataSourceOptions {
            has_header: true,
            ..Default::default()
        };
        let err = DataSource::parse_str("a;b;c\nx;y\n", &options).unwrap_err();
        assert!(err.to_string().contains("line 2"), "got: {}", err);
    }

    #[test]
    fn test_parse_keeps_empty_middle_fields() {
        let source = DataSource::parse_str("a;;c\n", &opts(false)).unwrap();
        assert_eq!(source.next().unwrap().fields, vec!["a", "", "c"]);
    }

    #[test]
    fn test_parse_crlf_lines() {
        let source = DataSource::parse_str("a;b\r\nc;d\r\n", &opts(false)).unwrap();
        assert_eq!(source.len(), 2);
        assert_eq!(source.next().unwrap().fields, vec!["a", "b"]);
    }

    #[test]
    fn test_parse_empty_content() {
        let source = DataSource::parse_str("# nothing\n\n", &opts(false)).unwrap();
        assert!(source.is_empty());
        assert_eq!(source.next(), Err(Exhausted));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "SEQUENTIAL\n1001;secret\n1002;secret\n").unwrap();
        let source = DataSource::load_from_file(file.path(), &opts(false)).unwrap();
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = DataSource::load_from_file(Path::new("/nonexistent/rows.csv"), &opts(false));
        assert!(matches!(result, Err(SipFlowError::DataParse(_))));
    }

    // --- Unit tests: next ---

    #[test]
    fn test_next_without_cycling_exhausts() {
        let source = DataSource::from_rows(vec![vec!["a".into()], vec!["b".into()]], false);
        assert_eq!(source.next().unwrap().index, 0);
        assert_eq!(source.next().unwrap().index, 1);
        assert_eq!(source.next(), Err(Exhausted));
        assert_eq!(source.next(), Err(Exhausted));
    }

    #[test]
    fn test_next_with_cycling_wraps_in_order() {
        let source = DataSource::from_rows(vec![vec!["a".into()], vec!["b".into()]], true);
        let order: Vec<usize> = (0..5).map(|_| source.next().unwrap().index).collect();
        assert_eq!(order, vec![0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_min_row_width_is_shortest_row() {
        let source = DataSource::parse_str("a;b;c\nx;y\n", &opts(false)).unwrap();
        assert_eq!(source.min_row_width(), 2);
        assert_eq!(DataSource::single_empty().min_row_width(), 0);
        assert_eq!(DataSource::from_rows(Vec::new(), false).min_row_width(), 0);
    }

    #[test]
    fn test_single_empty_never_exhausts() {
        let source = DataSource::single_empty();
        for _ in 0..10 {
            let row = source.next().unwrap();
            assert!(row.fields.is_empty());
        }
    }

    #[test]
    fn test_concurrent_next_never_repeats_a_row() {
        let rows: Vec<Vec<String>> = (0..1000).map(|i| vec![i.to_string()]).collect();
        let source = Arc::new(DataSource::from_rows(rows, false));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Ok(row) = source.next() {
                        taken.push(row.index);
                    }
                    taken
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for index in handle.join().unwrap() {
                assert!(seen.insert(index), "row {} handed out twice", index);
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
