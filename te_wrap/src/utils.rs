use anyhow::{bail, Result};
use itertools::Itertools;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Convert an io::error to a string and strip "(os error 4)" from the end.
fn io_error_to_string(err: &std::io::Error) -> String {
    let s = err.to_string();
    s.strip_suffix(&format!(" (os error {})", err.raw_os_error().unwrap_or(0)))
        .unwrap_or(&s)
        .to_string()
}

/// Print an error and its causes to stderr, one cause per line.
/// A bare io error from the root cause is printed without its os error code.
pub fn print_error_chain(err: &anyhow::Error) {
    let root_io = err.root_cause().downcast_ref::<std::io::Error>();
    let causes = err
        .chain()
        .map(|cause| match cause.downcast_ref::<std::io::Error>() {
            Some(io_err) if root_io.is_some() => io_error_to_string(io_err),
            _ => cause.to_string(),
        })
        .join("\n\tCaused by: ");
    eprintln!("ERROR: {causes}");
}

/// An input path given on the command line, canonicalized when parsed so
/// that it stays valid inside job scripts running in other directories.
#[derive(Clone, PartialEq, Eq)]
pub struct CliPath {
    path: PathBuf,
}

impl From<PathBuf> for CliPath {
    fn from(path: PathBuf) -> Self {
        CliPath { path }
    }
}

impl FromStr for CliPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<CliPath> {
        match Path::new(s).canonicalize() {
            Ok(p) => Ok(CliPath::from(p)),
            Err(e) => bail!("{s}: {}", io_error_to_string(&e)),
        }
    }
}

impl Display for CliPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        Display::fmt(&self.path.display(), f)
    }
}

impl Debug for CliPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        Debug::fmt(&self.path, f)
    }
}

impl From<CliPath> for PathBuf {
    fn from(obj: CliPath) -> PathBuf {
        obj.path
    }
}

impl AsRef<Path> for CliPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl Deref for CliPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_message() {
        let err = std::io::Error::from_raw_os_error(2);
        assert_eq!(io_error_to_string(&err), "No such file or directory");
    }

    #[test]
    fn test_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let parsed: CliPath = dir.path().to_str().unwrap().parse().unwrap();
        assert!(parsed.is_absolute());

        let missing = dir.path().join("missing.toml");
        let err = missing.to_str().unwrap().parse::<CliPath>().unwrap_err();
        assert!(err.to_string().contains("No such file or directory"), "{err}");
        assert!(!err.to_string().contains("os error"));
    }
}
