//! Persistent daemon GUID store (C8).
//!
//! The daemon's 128-bit identity is generated once and kept in
//! `<system-home>/PersistentGUID` as 32 lowercase hex digits. Reusing it
//! across restarts is what lets a remote daemon tell "still the same peer"
//! apart from "a new daemon reusing the address".

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::error::{Error, Result};

const FILE_NAME: &str = "PersistentGUID";

/// A 128-bit daemon identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generate a new random GUID.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Render as 32 lowercase hex digits.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse from 32 lowercase hex digits.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::ParseError(format!(
                "expected 32 hex digits, got {:?}",
                s
            )));
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::ParseError("GUID must be lowercase hex".into()));
        }

        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = chunk[0] as char;
            let lo = chunk[1] as char;
            let byte = (hi.to_digit(16).unwrap() as u8) << 4 | lo.to_digit(16).unwrap() as u8;
            bytes[i] = byte;
        }
        Ok(Self(bytes))
    }

    /// Read the persistent GUID for `system_home`, generating and saving one
    /// if none exists yet.
    pub fn persistent(system_home: impl AsRef<Path>) -> Result<Self> {
        let path = system_home.as_ref().join(FILE_NAME);
        match read_guid_file(&path) {
            Ok(guid) => Ok(guid),
            Err(Error::NoSuchFile(_)) => {
                let guid = Self::generate();
                write_guid_file(&path, &guid)?;
                Ok(guid)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Read `<system-home>/PersistentGUID`. Fails with `NoSuchFile` if absent,
/// `ParseError` if malformed.
pub fn get_persistent_guid(system_home: impl AsRef<Path>) -> Result<Guid> {
    read_guid_file(&system_home.as_ref().join(FILE_NAME))
}

/// Atomically write `<system-home>/PersistentGUID` (write-temp-then-rename).
/// No cross-process locking: concurrent writers race, last writer wins,
/// which is acceptable since the value never changes for a given daemon.
pub fn set_persistent_guid(system_home: impl AsRef<Path>, guid: &Guid) -> Result<()> {
    write_guid_file(&system_home.as_ref().join(FILE_NAME), guid)
}

fn read_guid_file(path: &Path) -> Result<Guid> {
    let contents = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoSuchFile(path.display().to_string())
        } else {
            Error::Io(e)
        }
    })?;

    if contents.ends_with("\n\n") || contents.lines().count() > 1 {
        return Err(Error::ParseError(format!(
            "{} contains more than one line",
            path.display()
        )));
    }

    Guid::from_hex(contents.trim_end_matches('\n'))
}

fn write_guid_file(path: &Path, guid: &Guid) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp_path: PathBuf = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(guid.to_hex().as_bytes())?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let guid = Guid::generate();
        let hex = guid.to_hex();
        assert_eq!(hex.len(), 32);
        let parsed = Guid::from_hex(&hex).unwrap();
        assert_eq!(guid, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Guid::from_hex("abcd").is_err());
    }

    #[test]
    fn rejects_uppercase() {
        let guid = Guid::generate();
        let upper = guid.to_hex().to_uppercase();
        assert!(Guid::from_hex(&upper).is_err());
    }

    #[test]
    fn missing_file_is_no_such_file() {
        let dir = std::env::temp_dir().join(format!("busd-guid-test-{}", std::process::id()));
        let err = get_persistent_guid(&dir).unwrap_err();
        assert!(matches!(err, Error::NoSuchFile(_)));
    }

    #[test]
    fn persistent_creates_then_reuses() {
        let dir = std::env::temp_dir().join(format!(
            "busd-guid-test-persist-{}-{}",
            std::process::id(),
            Guid::generate().to_hex()
        ));
        let first = Guid::persistent(&dir).unwrap();
        let second = Guid::persistent(&dir).unwrap();
        assert_eq!(first, second);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!(
            "busd-guid-test-setget-{}-{}",
            std::process::id(),
            Guid::generate().to_hex()
        ));
        let guid = Guid::generate();
        set_persistent_guid(&dir, &guid).unwrap();
        let read_back = get_persistent_guid(&dir).unwrap();
        assert_eq!(guid, read_back);
        std::fs::remove_dir_all(&dir).ok();
    }
}
