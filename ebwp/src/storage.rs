//! Backup storage destinations
//!
//! The archive engine only needs to know whether a destination can hold the
//! next archive. Concrete remote backends implement [`StorageProvider`]
//! outside this crate; [`LocalDirectory`] covers archives kept on the server.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub trait StorageProvider {
    fn name(&self) -> &str;

    /// Free bytes at the destination, or `None` when the provider cannot tell.
    fn available_space(&self) -> Result<Option<u64>>;
}

#[derive(Debug, Clone)]
pub struct LocalDirectory {
    path: PathBuf,
}

impl LocalDirectory {
    pub fn new<P: AsRef<Path>>(path: P) -> LocalDirectory {
        LocalDirectory {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageProvider for LocalDirectory {
    fn name(&self) -> &str {
        "server"
    }

    fn available_space(&self) -> Result<Option<u64>> {
        disk_free_space(&self.path)
    }
}

/// f_bavail * f_frsize, the space available to unprivileged processes.
#[cfg(unix)]
fn disk_free_space(path: &Path) -> Result<Option<u64>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        Error::InvalidFormat(format!("Path contains a NUL byte: {}", e))
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }

    #[allow(clippy::unnecessary_cast)]
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    tracing::debug!("{} has {} bytes available", path.display(), available);
    Ok(Some(available))
}

#[cfg(not(unix))]
fn disk_free_space(_path: &Path) -> Result<Option<u64>> {
    Ok(None)
}

/// Fail when the destination cannot hold `required` more bytes. Providers
/// that cannot report free space are trusted.
pub fn ensure_space(provider: &dyn StorageProvider, required: u64) -> Result<()> {
    let available = match provider.available_space() {
        Ok(Some(available)) => available,
        Ok(None) => {
            tracing::debug!("{} does not report free space", provider.name());
            return Ok(());
        }
        Err(e) => {
            tracing::warn!("Cannot query free space on {}: {}", provider.name(), e);
            return Ok(());
        }
    };

    if available > required {
        Ok(())
    } else {
        Err(Error::InsufficientSpace {
            required,
            available,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<u64>);

    impl StorageProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn available_space(&self) -> Result<Option<u64>> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_ensure_space() {
        assert!(ensure_space(&Fixed(Some(100)), 99).is_ok());
        assert!(matches!(
            ensure_space(&Fixed(Some(100)), 100),
            Err(Error::InsufficientSpace {
                required: 100,
                available: 100
            })
        ));
        assert!(ensure_space(&Fixed(None), u64::MAX).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_local_directory_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalDirectory::new(dir.path());
        assert!(local.available_space().unwrap().is_some());
    }
}
