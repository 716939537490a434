use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maps kernel volume names (`\Device\HarddiskVolume2`) to drive letters (`C:`).
///
/// Captured once per trace and stored in the trace manifest, so a log can be parsed after the
/// mapping changed or on another machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveMap(BTreeMap<String, String>);

impl DriveMap {
    pub fn new(volumes: BTreeMap<String, String>) -> Self {
        Self(volumes)
    }

    /// Reads the current mapping from the OS. Empty on every platform but Windows.
    pub fn capture() -> Self {
        Self(query_dos_devices())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_dos_path(&self, path: &str) -> Option<String> {
        let path = path.strip_prefix("\\??\\").unwrap_or(path);
        let bytes = path.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            return Some(path.to_owned());
        }

        self.0.iter().find_map(|(device, drive)| {
            let rest = path.strip_prefix(device.as_str())?;
            if rest.is_empty() {
                Some(format!("{drive}\\"))
            } else if rest.starts_with('\\') {
                Some(format!("{drive}{rest}"))
            } else {
                None
            }
        })
    }
}

#[cfg(windows)]
fn to_wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(windows)]
fn query_dos_devices() -> BTreeMap<String, String> {
    use windows_sys::Win32::Storage::FileSystem::QueryDosDeviceW;

    let mut volumes = BTreeMap::new();
    for letter in b'A'..=b'Z' {
        let drive = format!("{}:", letter as char);
        let name = to_wide(&drive);
        let mut buffer = [0u16; 1024];
        // SAFETY: `name` is NUL terminated and the length matches `buffer`.
        let len =
            unsafe { QueryDosDeviceW(name.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u32) };
        if len == 0 {
            continue;
        }
        // A list of NUL terminated targets, the first one is the active mapping.
        let end = buffer
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(len as usize);
        volumes.insert(String::from_utf16_lossy(&buffer[..end]), drive);
    }
    volumes
}

#[cfg(not(windows))]
fn query_dos_devices() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Expands 8.3 short components (`PROGRA~1`) to their long name.
#[cfg(windows)]
pub(super) fn long_path_name(path: &str) -> Option<String> {
    use windows_sys::Win32::Storage::FileSystem::GetLongPathNameW;

    let short = to_wide(path);
    let mut buffer = vec![0u16; 32_768];
    // SAFETY: `short` is NUL terminated and the length matches `buffer`.
    let len =
        unsafe { GetLongPathNameW(short.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u32) };
    if len == 0 || len as usize >= buffer.len() {
        return None;
    }
    Some(String::from_utf16_lossy(&buffer[..len as usize]))
}

#[cfg(not(windows))]
pub(super) fn long_path_name(_path: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drives() -> DriveMap {
        DriveMap::new(BTreeMap::from([
            ("\\Device\\HarddiskVolume2".to_owned(), "C:".to_owned()),
            ("\\Device\\HarddiskVolume10".to_owned(), "D:".to_owned()),
        ]))
    }

    #[test]
    fn test_device_path_is_mapped() {
        let drives = drives();
        assert_eq!(
            drives.to_dos_path("\\Device\\HarddiskVolume2\\Windows\\notepad.exe"),
            Some("C:\\Windows\\notepad.exe".to_owned())
        );
        assert_eq!(
            drives.to_dos_path("\\Device\\HarddiskVolume10\\data"),
            Some("D:\\data".to_owned())
        );
        assert_eq!(
            drives.to_dos_path("\\Device\\HarddiskVolume2"),
            Some("C:\\".to_owned())
        );
    }

    #[test]
    fn test_unmapped_volume_is_untracked() {
        let drives = drives();
        assert_eq!(drives.to_dos_path("\\Device\\HarddiskVolume1\\x"), None);
        assert_eq!(drives.to_dos_path("\\Device\\Mup\\server\\share"), None);
    }

    #[test]
    fn test_dos_path_passes_through() {
        assert_eq!(
            drives().to_dos_path("\\??\\C:\\Users"),
            Some("C:\\Users".to_owned())
        );
    }

    #[test]
    fn test_serialized_as_map() {
        let json = serde_json::to_string(&drives()).unwrap();
        assert_eq!(
            json,
            r#"{"\\Device\\HarddiskVolume10":"D:","\\Device\\HarddiskVolume2":"C:"}"#
        );
    }
}
