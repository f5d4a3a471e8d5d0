//! Class-file byte sources backed by directories and jar files.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::repository::ClassBytesProvider;

/// Resolves class bytes against an ordered list of directories and jar
/// files, the way a JVM class path would. Directories are checked first,
/// then jars, each in insertion order.
#[derive(Default)]
pub struct ClasspathProvider {
    dirs: Vec<PathBuf>,
    jars: Vec<ZipArchive<File>>,
}

impl ClasspathProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dir(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }

    pub fn add_jar(&mut self, path: &Path) -> io::Result<()> {
        let file = File::open(path)?;
        let archive =
            ZipArchive::new(file).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.jars.push(archive);
        Ok(())
    }
}

impl ClassBytesProvider for ClasspathProvider {
    fn fetch(&mut self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let rel = format!("{name}.class");

        for dir in &self.dirs {
            let path = dir.join(&rel);
            if path.is_file() {
                debug!("reading {name} from {}", path.display());
                return fs::read(&path).map(Some);
            }
        }

        for archive in &mut self.jars {
            match archive.by_name(&rel) {
                Ok(mut entry) => {
                    let mut bytes = Vec::with_capacity(entry.size() as usize);
                    entry.read_to_end(&mut bytes)?;
                    return Ok(Some(bytes));
                }
                Err(ZipError::FileNotFound) => continue,
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        Ok(None)
    }
}

impl std::fmt::Debug for ClasspathProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClasspathProvider")
            .field("dirs", &self.dirs)
            .field("jars", &self.jars.len())
            .finish()
    }
}
