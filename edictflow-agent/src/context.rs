//! Project context detection from marker files

use std::path::Path;

/// Marker file -> context type
const MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("go.mod", "go"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "python"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("Dockerfile", "docker"),
];

/// Context types of the project rooted at `dir`, sorted and deduplicated
pub fn detect_context(dir: &Path) -> Vec<String> {
    let mut types: Vec<String> = MARKERS
        .iter()
        .filter(|(marker, _)| dir.join(marker).is_file())
        .map(|(_, kind)| kind.to_string())
        .collect();
    types.sort();
    types.dedup();
    types
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers() {
        let dir = tempfile::tempdir().unwrap();
        assert!(detect_context(dir.path()).is_empty());

        for marker in ["Cargo.toml", "Dockerfile", "pyproject.toml", "requirements.txt"] {
            std::fs::write(dir.path().join(marker), "").unwrap();
        }
        assert_eq!(detect_context(dir.path()), vec!["docker", "python", "rust"]);
    }

    #[test]
    fn test_directories_are_not_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("go.mod")).unwrap();
        assert!(detect_context(dir.path()).is_empty());
    }
}
