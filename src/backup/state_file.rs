use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use std::fs::File;
use std::io::{BufReader, ErrorKind, Write};
use std::path::Path;

/// Serializes `value` to pretty JSON and atomically replaces `path` with it.
pub fn save_json<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().ok_or_else(|| {
        Error::invalid_configuration(format!("state file {path:?} has no parent directory"))
    })?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(path)
        .map_err(|e| Error::from(e.error))
        .add_msg(format!("Persisting state file {path:?} failed"))?;
    Ok(())
}

/// Loads `path` as JSON, falling back to `T::default()` when the file does
/// not exist yet.
pub fn load_json_or_default<T: DeserializeOwned + Default, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(Error::from(e).add_msg(format!("Opening state file {path:?} failed"))),
    };
    serde_json::from_reader(BufReader::new(file))
        .map_err(Error::from)
        .add_msg(format!("Parsing state file {path:?} failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        save_json(&path, &vec![1u32, 2, 3]).unwrap();
        let loaded: Vec<u32> = load_json_or_default(&path).unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn missing_file_yields_default() {
        let tmp = TempDir::new().unwrap();
        let loaded: Vec<u32> = load_json_or_default(tmp.path().join("absent.json")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_replaces_previous_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        save_json(&path, &vec![1u32]).unwrap();
        save_json(&path, &vec![2u32, 3]).unwrap();
        let loaded: Vec<u32> = load_json_or_default(&path).unwrap();
        assert_eq!(loaded, vec![2, 3]);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_json_or_default::<Vec<u32>, _>(&path).is_err());
    }
}
