//! Installable server packages.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::InstanceError;

/// A named archive that seeds an instance's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    pub archive: PathBuf,
}

impl Package {
    pub fn new(name: impl Into<String>, archive: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            archive: archive.into(),
        }
    }

    /// Unpacks the archive into `dir`.
    pub fn extract_to(&self, dir: &Path) -> Result<(), InstanceError> {
        if !self.archive.is_file() {
            return Err(InstanceError::PackageMissing(self.archive.clone()));
        }
        let file = File::open(&self.archive)?;
        let mut archive = zip::ZipArchive::new(file)?;
        fs::create_dir_all(dir)?;
        archive.extract(dir)?;
        Ok(())
    }
}

/// Looks packages up by name.
pub trait PackageCatalog: Send + Sync {
    fn find(&self, name: &str) -> Option<Package>;

    fn all(&self) -> Vec<Package>;
}

/// A fixed list of packages, matched case-insensitively.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    packages: Vec<Package>,
}

impl StaticCatalog {
    pub fn new(packages: impl IntoIterator<Item = Package>) -> Self {
        Self {
            packages: packages.into_iter().collect(),
        }
    }
}

impl PackageCatalog for StaticCatalog {
    fn find(&self, name: &str) -> Option<Package> {
        self.packages
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn all(&self) -> Vec<Package> {
        self.packages.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_catalog_lookup_ignores_case() {
        let catalog = StaticCatalog::new([Package::new("Vanilla", "/p/vanilla.zip")]);
        assert_eq!(catalog.find("vanilla").map(|p| p.name), Some("Vanilla".into()));
        assert!(catalog.find("modded").is_none());
        assert_eq!(catalog.all().len(), 1);
    }

    #[test]
    fn test_extract_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg.zip");
        let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
        zip.start_file("server.properties", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"motd=hi\n").unwrap();
        zip.finish().unwrap();

        let target = dir.path().join("out");
        Package::new("Test", &archive).extract_to(&target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("server.properties")).unwrap(),
            "motd=hi\n"
        );
    }

    #[test]
    fn test_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let err = Package::new("Gone", dir.path().join("gone.zip"))
            .extract_to(&dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, InstanceError::PackageMissing(_)));
    }
}
