//! Validation functions for configuration values.
//!
//! Custom path checks used by the YAML configuration.

use validator::ValidationError;

use std::path::Path;

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory")
                .with_message(format!("cannot create or access dir {:?}: {}", dir, e).into())
        });
    }

    Ok(())
}

pub fn validate_writable_dir<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    validate_dir_exist_or_created(dir)?;
    let md = std::fs::metadata(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot access metadata for {:?}: {}", dir, e).into())
    })?;
    if md.permissions().readonly() {
        Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("cannot write to dir {:?}", dir).into()))
    } else {
        Ok(())
    }
}

pub fn validate_file_exist<P: AsRef<Path>>(file: P) -> Result<(), ValidationError> {
    let file = file.as_ref();
    if !file.is_file() {
        return Err(ValidationError::new("InvalidFile")
            .with_message(format!("{:?} is not an existing file", file).into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dir_exist_requires_directory() {
        let tmp = TempDir::new().unwrap();
        assert!(validate_dir_exist(tmp.path()).is_ok());
        assert!(validate_dir_exist(tmp.path().join("missing")).is_err());

        let file = tmp.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_dir_exist(&file).is_err());
    }

    #[test]
    fn dir_exist_or_created_creates_missing_dirs() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        assert!(validate_dir_exist_or_created(&nested).is_ok());
        assert!(nested.is_dir());
    }

    #[test]
    fn file_exist_requires_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("config.yml");
        assert!(validate_file_exist(&file).is_err());
        std::fs::write(&file, "x").unwrap();
        assert!(validate_file_exist(&file).is_ok());
        assert!(validate_file_exist(tmp.path()).is_err());
    }
}
