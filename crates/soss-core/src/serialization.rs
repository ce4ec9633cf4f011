use crate::domain::{SossError, SossResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

pub fn normalize_text_artifact(content: &str) -> String {
    let mut normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

pub fn write_text_artifact(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, normalize_text_artifact(content))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> SossResult<T> {
    let source = fs::read_to_string(path).map_err(|error| {
        SossError::io_system(
            "IO.READ",
            format!("failed to read '{}': {}", path.display(), error),
        )
    })?;
    serde_json::from_str(&source).map_err(|error| {
        SossError::io_system(
            "IO.PARSE",
            format!("failed to parse '{}': {}", path.display(), error),
        )
    })
}

/// Pretty JSON with a canonical trailing newline. Non-finite floats are written as `null`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> SossResult<()> {
    let content = serde_json::to_string_pretty(value).map_err(|error| {
        SossError::io_system(
            "IO.SERIALIZE",
            format!("failed to serialize '{}': {}", path.display(), error),
        )
    })?;
    write_text_artifact(path, &content).map_err(|error| {
        SossError::io_system(
            "IO.WRITE",
            format!("failed to write '{}': {}", path.display(), error),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::{normalize_text_artifact, read_json, write_json};
    use crate::domain::SossErrorCategory;
    use crate::products::WaveGridProduct;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn normalize_text_artifact_uses_canonical_line_endings() {
        assert_eq!(normalize_text_artifact("alpha\r\nbeta\rgamma"), "alpha\nbeta\ngamma\n");
    }

    #[test]
    fn repeated_json_writes_produce_identical_bytes() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("grid.json");
        let grid = WaveGridProduct {
            wavegrid: vec![0.9, 1.0, 1.1],
        };

        write_json(&path, &grid).expect("first write should succeed");
        let first = fs::read(&path).expect("artifact should be readable");
        write_json(&path, &grid).expect("second write should succeed");
        let second = fs::read(&path).expect("artifact should be readable");

        assert_eq!(first, second);
        assert_eq!(second.last(), Some(&b'\n'));
        let parsed: WaveGridProduct = read_json(&path).expect("grid should parse");
        assert_eq!(parsed, grid);
    }

    #[test]
    fn missing_and_malformed_files_are_io_errors() {
        let temp = TempDir::new().expect("tempdir should be created");
        let missing = temp.path().join("missing.json");
        let error = read_json::<WaveGridProduct>(&missing).expect_err("missing file");
        assert_eq!(error.category(), SossErrorCategory::IoSystem);
        assert_eq!(error.code(), "IO.READ");

        let malformed = temp.path().join("bad.json");
        fs::write(&malformed, "{ not json").expect("write");
        let error = read_json::<WaveGridProduct>(&malformed).expect_err("bad json");
        assert_eq!(error.code(), "IO.PARSE");
    }
}
