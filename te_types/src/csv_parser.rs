use anyhow::{anyhow, bail, Context, Result};
use csv::StringRecord;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Helper class for parsing delimited configuration files (sample sheets), validating them &
/// providing good error messages
pub struct CsvParser {
    filetype: String,
    filename: PathBuf,
    headers: Vec<String>,
    rows: Vec<StringRecord>,
    col_map: HashMap<String, usize>,
    line: usize,
}

impl CsvParser {
    /// Create a parser / validator for file `filename`, with fields separated by `delimiter`.
    /// `required_headers` are checked and an error will be returned if they're not present.
    /// `filetype` is a readable description of the kind of file being parsed and will be used in
    /// error messages.
    pub fn new<T: AsRef<str>>(
        filename: &Path,
        delimiter: u8,
        required_headers: impl IntoIterator<Item = T>,
        filetype: &str,
    ) -> Result<CsvParser> {
        let file = File::open(filename).with_context(|| filename.display().to_string())?;
        let buf_rdr = BufReader::new(file);
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_reader(buf_rdr);

        let mut headers = rdr
            .headers()
            .with_context(|| filename.display().to_string())?
            .clone();
        headers.trim();
        let headers: Vec<_> = headers.iter().map(String::from).collect();

        let mut rows = Vec::new();
        for result in rdr.records() {
            let mut record = result.with_context(|| filename.display().to_string())?;
            record.trim();
            // tolerate blank trailing lines
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record);
        }

        let col_map = CsvParser::check_headers(filename, required_headers, &headers)?;

        Ok(CsvParser {
            filetype: filetype.to_string(),
            filename: filename.to_path_buf(),
            headers,
            rows,
            col_map,
            line: 0,
        })
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// File name
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Headers found in the file
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Does the file have a column named `col`
    pub fn has_column(&self, col: &str) -> bool {
        self.col_map.contains_key(col)
    }

    /// Set the line number (not including the header) to pull data from
    pub fn set_line(&mut self, line: usize) {
        self.line = line;
    }

    /// Get map of extra key-value pairs in columns that aren't listed in `ignore_cols`.
    /// Unnamed columns (e.g. a written-out dataframe index) are skipped.
    pub fn get_extra_data(&self, ignore_cols: &[&str]) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .filter(|h| !h.is_empty() && !ignore_cols.contains(&h.as_str()))
            .filter_map(|h| self.try_get_string(h).map(|v| (h.clone(), v)))
            .collect()
    }

    /// Get a value of type `T` from column `col` on the current line.
    /// Returns an error if the contents cannot be parsed as `T`.
    /// Returns Ok(None) for an empty field or a missing column.
    pub fn try_parse_field<T>(&self, col: &str, expected: &str) -> Result<Option<T>>
    where
        T: FromStr,
        Result<T, <T as FromStr>::Err>: anyhow::Context<T, <T as FromStr>::Err>,
    {
        let Some(v) = self.try_get_string(col) else {
            return Ok(None);
        };

        Ok(Some(v.parse::<T>().with_context(|| {
            format!(
                "Error in {} file '{}'. On line {} in '{col}' column: \
                 Expected a {expected} but received '{v}'",
                self.filetype,
                self.filename.display(),
                self.line + 1
            )
        })?))
    }

    /// Get a string from column `col` on the current line.
    /// Returns an error on an empty string or a missing column.
    pub fn require_string(&self, col: &str) -> Result<String> {
        self.try_get_string(col).ok_or_else(|| {
            anyhow!(
                "Error in {} file '{}'. On line {} in '{col}' column: \
                 Value required but cell is empty.",
                self.filetype,
                self.filename.display(),
                self.line + 1,
            )
        })
    }

    /// Get a string from column `col` on the current line.
    /// Returns "" for an empty string or a missing column.
    pub fn get_string(&self, col: &str) -> String {
        self.try_get_string(col).unwrap_or_default()
    }

    /// Get a string from column `col` on the current line.
    /// Returns None for an empty string, a short row or a missing column.
    pub fn try_get_string(&self, col: &str) -> Option<String> {
        let col = *self.col_map.get(col)?;
        let val = self.rows[self.line].get(col)?.trim();
        if val.is_empty() {
            None
        } else {
            Some(val.to_string())
        }
    }

    fn check_headers<T: AsRef<str>>(
        file_arg: &Path,
        required: impl IntoIterator<Item = T>,
        headers: &[String],
    ) -> Result<HashMap<String, usize>> {
        // check that we have required headers
        for r in required {
            if !headers.iter().any(|h| h == r.as_ref()) {
                bail!(
                    "The input file '{}' must contain a column named '{}', but it was not found. \
                    Please check the headers in the file.",
                    file_arg.display(),
                    r.as_ref()
                );
            }
        }

        // column name to column index map
        Ok(headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_string(), i))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tab_separated() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "\tsample_id\tregion\treads")?;
        writeln!(file, "0\tA\tPUT\t1200")?;
        writeln!(file, "1\tB\tPUT\t")?;
        writeln!(file)?;

        let mut parser = CsvParser::new(file.path(), b'\t', ["sample_id", "region"], "Sample sheet")?;
        assert_eq!(parser.len(), 2);
        assert_eq!(parser.require_string("sample_id")?, "A");
        assert_eq!(parser.try_parse_field::<u64>("reads", "number")?, Some(1200));
        assert_eq!(
            parser.get_extra_data(&["sample_id", "region"]),
            BTreeMap::from([("reads".to_string(), "1200".to_string())])
        );

        parser.set_line(1);
        assert_eq!(parser.try_parse_field::<u64>("reads", "number")?, None);
        assert!(parser.require_string("reads").is_err());
        assert_eq!(parser.get_string("missing"), "");
        Ok(())
    }

    #[test]
    fn test_missing_required_header() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "sample_id\tarea")?;
        writeln!(file, "A\tPUT")?;
        let err = CsvParser::new(file.path(), b'\t', ["sample_id", "region"], "Sample sheet")
            .err()
            .unwrap();
        assert!(err.to_string().contains("'region'"));
        Ok(())
    }
}
