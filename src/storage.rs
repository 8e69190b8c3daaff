//! The transfer worker: list, store and retrieve files in one flat storage root.
//!
//! Every operation takes its inputs by value and returns a value, so it can run on
//! a pool thread or inside a separate worker process alike.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{common::reply, error::TransferError};

/// An operation submitted to the dispatch pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOp {
    List,
    Store { filename: String, data: Vec<u8> },
    Retrieve { filename: String },
}

impl WorkerOp {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Store { .. } => "store",
            Self::Retrieve { .. } => "retrieve",
        }
    }
}

/// The value a worker hands back for a [`WorkerOp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    /// Newline separated file names, or the empty-store message.
    Listing(String),
    Stored,
    Content(Vec<u8>),
    NotFound,
    /// The operation failed; the text describes why.
    Failed(String),
}

/// Check that `filename` names an entry directly inside the storage root.
pub fn validate_filename(filename: &str) -> Result<(), TransferError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(&['/', '\\', '\0'][..]);
    if invalid {
        return Err(TransferError::Protocol(format!(
            "invalid filename {:?}",
            filename
        )));
    }
    Ok(())
}

/// The storage root directory.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open the storage root, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, TransferError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, filename: &str) -> Result<PathBuf, TransferError> {
        validate_filename(filename)?;
        Ok(self.root.join(filename))
    }

    /// Names of the stored files, sorted, one per line.
    pub fn list(&self) -> Result<String, TransferError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        if names.is_empty() {
            return Ok(reply::NO_FILES.to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }

    /// Write `data` to `filename`, replacing any previous content.
    pub fn store(&self, filename: &str, data: &[u8]) -> Result<(), TransferError> {
        let path = self.path_of(filename)?;
        fs::write(&path, data)?;
        debug!("Stored {} bytes in {}", data.len(), path.display());
        Ok(())
    }

    /// Read the whole content of `filename`.
    pub fn retrieve(&self, filename: &str) -> Result<Vec<u8>, TransferError> {
        let path = self.path_of(filename)?;
        if !path.is_file() {
            return Err(TransferError::NotFound(filename.to_string()));
        }
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(TransferError::NotFound(filename.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run one operation and fold its outcome into a reply.
    pub fn execute(&self, op: WorkerOp) -> WorkerReply {
        let result = match op {
            WorkerOp::List => self.list().map(WorkerReply::Listing),
            WorkerOp::Store { filename, data } => {
                self.store(&filename, &data).map(|_| WorkerReply::Stored)
            }
            WorkerOp::Retrieve { filename } => self.retrieve(&filename).map(WorkerReply::Content),
        };
        match result {
            Ok(reply) => reply,
            Err(TransferError::NotFound(_)) => WorkerReply::NotFound,
            Err(err) => WorkerReply::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_list_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.list().unwrap(), "No files available.");
    }

    #[test]
    fn test_store_and_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("nested")).unwrap();
        storage.store("b.txt", b"second").unwrap();
        storage.store("a.txt", b"first").unwrap();
        storage.store("a.txt", b"overwritten").unwrap();

        assert_eq!(storage.retrieve("a.txt").unwrap(), b"overwritten");
        assert_eq!(storage.list().unwrap(), "a.txt\nb.txt");
    }

    #[test]
    fn test_list_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.store("only.bin", &[1, 2, 3]).unwrap();
        assert_eq!(storage.list().unwrap(), "only.bin");
    }

    #[test]
    fn test_retrieve_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        assert!(matches!(
            storage.retrieve("missing.bin"),
            Err(TransferError::NotFound(_))
        ));
        assert_eq!(
            storage.execute(WorkerOp::Retrieve {
                filename: "missing.bin".to_string()
            }),
            WorkerReply::NotFound
        );
    }

    #[test]
    fn test_rejects_names_outside_root() {
        for name in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "nul\0"] {
            assert!(validate_filename(name).is_err(), "{name:?} accepted");
        }
        assert!(validate_filename("report.2024.csv").is_ok());

        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let reply = storage.execute(WorkerOp::Store {
            filename: "../escape".to_string(),
            data: vec![0],
        });
        assert!(matches!(reply, WorkerReply::Failed(_)));
        assert!(!dir.path().parent().unwrap().join("escape").exists());
    }
}
