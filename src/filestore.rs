//! Filesystem boundary of the engine.
//!
//! Sending transactions read their source file relative to an outgoing root, receiving
//! transactions write into an incoming root. Both roots are owned by the [VirtualFilestore]
//! implementation, and all paths passed in by users or remote entities are resolved against
//! them. Absolute paths and paths which climb out of the root are rejected.
use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, Read},
    path::{Component, Path, PathBuf},
};

use spacepackets::cfdp::ChecksumType;

use crate::checksum::FileChecksum;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("is not a file")]
    IsNotFile,
    #[error("invalid path {0:?}: path must be relative and must not leave its root")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
}

/// Returns whether the path is relative and only consists of normal components.
pub fn is_relative_path_inside_root(path: &str) -> bool {
    let path = Path::new(path);
    if path.as_os_str().is_empty() {
        return false;
    }
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

pub trait VirtualFilestore {
    /// Resolves a path of a file to send.
    fn outgoing_path(&self, relative: &str) -> Result<PathBuf, FilestoreError>;

    /// Resolves a path of a file to receive.
    fn incoming_path(&self, relative: &str) -> Result<PathBuf, FilestoreError>;

    fn exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> Result<u64, FilestoreError>;

    fn open_read(&self, path: &Path) -> Result<File, FilestoreError>;

    /// Creates all missing parent directories and creates or truncates the file.
    fn open_write(&self, path: &Path) -> Result<File, FilestoreError>;

    fn remove_file(&self, path: &Path) -> Result<(), FilestoreError>;

    /// Persists a copy of a received directive to the staging area. Returns [false] if no
    /// staging area is configured.
    fn stage(&self, name: &str, data: &[u8]) -> Result<bool, FilestoreError>;

    /// This special function is the CFDP specific abstraction to calculate the checksum of a file.
    /// This allows to keep OS specific details like reading the whole file in the most efficient
    /// manner inside the file system abstraction.
    ///
    /// The passed verification buffer argument will be used by the specific implementation as
    /// a buffer to read the file into. It is recommended to use common buffer sizes like
    /// 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        path: &Path,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    fn checksum_verify(
        &self,
        expected_checksum: u32,
        path: &Path,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        Ok(
            self.calculate_checksum(path, checksum_type, size_to_verify, verification_buf)?
                == expected_checksum,
        )
    }
}

/// [VirtualFilestore] on top of the native filesystem.
#[derive(Debug, Clone)]
pub struct NativeFilestore {
    outgoing_root: PathBuf,
    incoming_root: PathBuf,
    staging_root: Option<PathBuf>,
}

impl NativeFilestore {
    pub fn new(
        outgoing_root: impl Into<PathBuf>,
        incoming_root: impl Into<PathBuf>,
        staging_root: Option<PathBuf>,
    ) -> Self {
        Self {
            outgoing_root: outgoing_root.into(),
            incoming_root: incoming_root.into(),
            staging_root,
        }
    }

    /// Uses the same directory for sending and receiving and disables staging.
    pub fn new_with_single_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self::new(root.clone(), root, None)
    }

    pub fn outgoing_root(&self) -> &Path {
        &self.outgoing_root
    }

    pub fn incoming_root(&self) -> &Path {
        &self.incoming_root
    }

    pub fn staging_root(&self) -> Option<&Path> {
        self.staging_root.as_deref()
    }

    fn resolve(root: &Path, relative: &str) -> Result<PathBuf, FilestoreError> {
        if !is_relative_path_inside_root(relative) {
            return Err(FilestoreError::InvalidPath(relative.to_string()));
        }
        Ok(root.join(relative))
    }
}

impl VirtualFilestore for NativeFilestore {
    fn outgoing_path(&self, relative: &str) -> Result<PathBuf, FilestoreError> {
        Self::resolve(&self.outgoing_root, relative)
    }

    fn incoming_path(&self, relative: &str) -> Result<PathBuf, FilestoreError> {
        Self::resolve(&self.incoming_root, relative)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn file_size(&self, path: &Path) -> Result<u64, FilestoreError> {
        if !path.exists() {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !path.is_file() {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(path.metadata()?.len())
    }

    fn open_read(&self, path: &Path) -> Result<File, FilestoreError> {
        if !path.exists() {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !path.is_file() {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(File::open(path)?)
    }

    fn open_write(&self, path: &Path) -> Result<File, FilestoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?)
    }

    fn remove_file(&self, path: &Path) -> Result<(), FilestoreError> {
        if !path.exists() {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !path.is_file() {
            return Err(FilestoreError::IsNotFile);
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn stage(&self, name: &str, data: &[u8]) -> Result<bool, FilestoreError> {
        let staging_root = match &self.staging_root {
            Some(root) => root,
            None => return Ok(false),
        };
        let path = Self::resolve(staging_root, name)?;
        fs::create_dir_all(staging_root)?;
        fs::write(path, data)?;
        Ok(true)
    }

    fn calculate_checksum(
        &self,
        path: &Path,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        let mut checksum = FileChecksum::new(checksum_type)
            .ok_or(FilestoreError::ChecksumTypeNotImplemented(checksum_type))?;
        if checksum_type == ChecksumType::NullChecksum {
            return Ok(0);
        }
        let mut buf_reader = BufReader::new(self.open_read(path)?);
        let mut offset = 0;
        while offset < size_to_verify {
            // Read the smaller of the remaining bytes or the buffer size
            let bytes_to_read =
                (size_to_verify - offset).min(verification_buf.len() as u64) as usize;
            let bytes_read = buf_reader.read(&mut verification_buf[0..bytes_to_read])?;
            if bytes_read == 0 {
                break;
            }
            checksum.update(offset, &verification_buf[0..bytes_read]);
            offset += bytes_read as u64;
        }
        Ok(checksum.finalize())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::tempdir;

    use super::*;
    use crate::checksum::CRC_32;

    const EXAMPLE_DATA_CFDP: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    #[test]
    fn test_path_checks() {
        assert!(is_relative_path_inside_root("a.txt"));
        assert!(is_relative_path_inside_root("sub/dir/a.txt"));
        assert!(is_relative_path_inside_root("./a.txt"));
        assert!(!is_relative_path_inside_root(""));
        assert!(!is_relative_path_inside_root("/abs/path"));
        assert!(!is_relative_path_inside_root("../a.txt"));
        assert!(!is_relative_path_inside_root("sub/../../a.txt"));
    }

    #[test]
    fn test_resolve_paths() {
        let filestore = NativeFilestore::new("/out", "/in", None);
        assert_eq!(
            filestore.outgoing_path("a.txt").unwrap(),
            PathBuf::from("/out/a.txt")
        );
        assert_eq!(
            filestore.incoming_path("x/b.txt").unwrap(),
            PathBuf::from("/in/x/b.txt")
        );
        assert!(matches!(
            filestore.incoming_path("/etc/passwd"),
            Err(FilestoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_open_write_creates_directories() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let filestore = NativeFilestore::new_with_single_root(tmpdir.path());
        let path = filestore.incoming_path("nested/dir/test.bin").unwrap();
        assert!(!filestore.exists(&path));
        let mut file = filestore.open_write(&path).unwrap();
        file.write_all(&EXAMPLE_DATA_CFDP).unwrap();
        drop(file);
        assert!(filestore.exists(&path));
        assert_eq!(filestore.file_size(&path).unwrap(), 15);
        // Reopening truncates.
        drop(filestore.open_write(&path).unwrap());
        assert_eq!(filestore.file_size(&path).unwrap(), 0);
        filestore.remove_file(&path).unwrap();
        assert!(!filestore.exists(&path));
        assert!(matches!(
            filestore.remove_file(&path),
            Err(FilestoreError::FileDoesNotExist)
        ));
    }

    #[test]
    fn test_file_size_of_directory() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let filestore = NativeFilestore::new_with_single_root(tmpdir.path());
        assert!(matches!(
            filestore.file_size(tmpdir.path()),
            Err(FilestoreError::IsNotFile)
        ));
        assert!(matches!(
            filestore.open_read(&tmpdir.path().join("missing.txt")),
            Err(FilestoreError::FileDoesNotExist)
        ));
    }

    #[test]
    fn test_checksums() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let filestore = NativeFilestore::new_with_single_root(tmpdir.path());
        let path = tmpdir.path().join("data.bin");
        fs::write(&path, EXAMPLE_DATA_CFDP).unwrap();
        let mut buf = [0; 4];
        let crc = filestore
            .calculate_checksum(&path, ChecksumType::Crc32, 15, &mut buf)
            .unwrap();
        assert_eq!(crc, CRC_32.checksum(&EXAMPLE_DATA_CFDP));
        assert!(filestore
            .checksum_verify(crc, &path, ChecksumType::Crc32, 15, &mut buf)
            .unwrap());
        let modular = filestore
            .calculate_checksum(&path, ChecksumType::Modular, 15, &mut buf)
            .unwrap();
        let expected = 0x00010203u32
            .wrapping_add(0x04050607)
            .wrapping_add(0x08090a0b)
            .wrapping_add(0x0c0d0e00);
        assert_eq!(modular, expected);
        assert_eq!(
            filestore
                .calculate_checksum(&path, ChecksumType::NullChecksum, 15, &mut buf)
                .unwrap(),
            0
        );
        assert!(matches!(
            filestore.calculate_checksum(&path, ChecksumType::Crc32Proximity1, 15, &mut buf),
            Err(FilestoreError::ChecksumTypeNotImplemented(ChecksumType::Crc32Proximity1))
        ));
    }

    #[test]
    fn test_checksum_of_prefix() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let filestore = NativeFilestore::new_with_single_root(tmpdir.path());
        let path = tmpdir.path().join("data.bin");
        fs::write(&path, EXAMPLE_DATA_CFDP).unwrap();
        let mut buf = [0; 64];
        let crc = filestore
            .calculate_checksum(&path, ChecksumType::Crc32C, 8, &mut buf)
            .unwrap();
        assert_eq!(crc, crate::checksum::CRC_32C.checksum(&EXAMPLE_DATA_CFDP[..8]));
    }

    #[test]
    fn test_staging() {
        let tmpdir = tempdir().expect("creating tmpdir failed");
        let staging = tmpdir.path().join("staging");
        let filestore = NativeFilestore::new(tmpdir.path(), tmpdir.path(), Some(staging.clone()));
        assert!(filestore.stage("1_5.metadata", &[1, 2, 3]).unwrap());
        assert_eq!(fs::read(staging.join("1_5.metadata")).unwrap(), vec![1, 2, 3]);
        let without_staging = NativeFilestore::new_with_single_root(tmpdir.path());
        assert!(!without_staging.stage("1_5.metadata", &[1]).unwrap());
    }
}
