//! Input file fingerprints.
//!
//! A component is a jar (or raw dex file) identified by its path, size and the
//! checksums it already carries for each embedded dex image. Fingerprints are
//! never cached: every check re-reads the live files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use odrefresh_dexsum::{
    CentralDirectory, Container, DEX_HEADER_PREFIX_SIZE, DexHeader, EOCD_SEARCH_WINDOW,
    EndOfCentralDirectory,
};
use serde::{Deserialize, Serialize};

use crate::config::OdrConfig;
use crate::error::{IoContext, OdrError};

/// Fingerprint of one input file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Path as it appears on the classpath.
    pub file: String,
    /// File size in bytes.
    pub size: u64,
    /// `%08x` checksum of every embedded dex image, colon joined.
    pub checksums: String,
}

/// A system server jar fingerprint plus how it is loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemServerComponent {
    /// The jar's fingerprint.
    #[serde(flatten)]
    pub component: Component,
    /// `true` for the linear classpath, `false` for standalone jars.
    pub is_in_classpath: bool,
}

/// Fingerprint every jar in order. One unreadable file fails the whole list.
pub fn fingerprint_all(config: &OdrConfig, jars: &[String]) -> Result<Vec<Component>, OdrError> {
    jars.iter().map(|jar| fingerprint(config, jar)).collect()
}

/// Fingerprint the system server jars, tagging classpath membership.
pub fn fingerprint_system_server(
    config: &OdrConfig,
) -> Result<Vec<SystemServerComponent>, OdrError> {
    config
        .all_system_server_jars()
        .iter()
        .map(|jar| {
            Ok(SystemServerComponent {
                component: fingerprint(config, jar)?,
                is_in_classpath: config.in_system_server_classpath(jar),
            })
        })
        .collect()
}

/// Fingerprint a single classpath entry.
pub fn fingerprint(config: &OdrConfig, jar: &str) -> Result<Component, OdrError> {
    let path = config.resolve(jar);
    let mut file = File::open(&path).io_context("failed to open", &path)?;
    let size = file.metadata().io_context("failed to stat", &path)?.len();
    let checksums = read_checksums(&mut file, size)
        .io_context("failed to read checksums from", &path)?
        .iter()
        .map(|c| format!("{c:08x}"))
        .collect::<Vec<_>>()
        .join(":");

    Ok(Component {
        file: jar.to_string(),
        size,
        checksums,
    })
}

/// Read the embedded checksums, touching only the header or the zip directory.
fn read_checksums(file: &mut File, size: u64) -> std::io::Result<Vec<u32>> {
    let invalid = |e: odrefresh_dexsum::DexsumError| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    };

    let mut head = [0u8; DEX_HEADER_PREFIX_SIZE];
    let head_len = usize::try_from(size.min(DEX_HEADER_PREFIX_SIZE as u64)).unwrap_or(0);
    file.read_exact(&mut head[..head_len])?;

    match Container::sniff(&head[..head_len]).map_err(invalid)? {
        Container::Dex => Ok(vec![DexHeader::parse(&head[..head_len]).map_err(invalid)?.checksum]),
        Container::Zip => {
            let window = size.min(EOCD_SEARCH_WINDOW as u64);
            let mut tail = vec![0u8; usize::try_from(window).unwrap_or(0)];
            file.seek(SeekFrom::Start(size - window))?;
            file.read_exact(&mut tail)?;
            let eocd = EndOfCentralDirectory::find(&tail).map_err(invalid)?;

            if u64::from(eocd.cd_offset) + u64::from(eocd.cd_size) > size {
                return Err(invalid(odrefresh_dexsum::DexsumError::InvalidOffset));
            }
            let mut cd = vec![0u8; eocd.cd_size as usize];
            file.seek(SeekFrom::Start(u64::from(eocd.cd_offset)))?;
            file.read_exact(&mut cd)?;

            CentralDirectory::parse(&cd, eocd.entries)
                .and_then(|dir| dir.multidex_crcs())
                .map_err(invalid)
        }
    }
}

/// Compare recorded fingerprints against live ones, returning the first difference.
///
/// Lengths are compared first, then per entry the path, the size and only then
/// the checksums.
pub fn compare_components(expected: &[Component], actual: &[Component]) -> Result<(), String> {
    if expected.len() != actual.len() {
        return Err(format!(
            "component count differs ({} != {})",
            expected.len(),
            actual.len()
        ));
    }
    for (e, a) in expected.iter().zip(actual) {
        if e.file != a.file {
            return Err(format!("component path differs ({} != {})", e.file, a.file));
        }
        if e.size != a.size {
            return Err(format!("size differs for {} ({} != {})", e.file, e.size, a.size));
        }
        if e.checksums != a.checksums {
            return Err(format!(
                "checksums differ for {} ({} != {})",
                e.file, e.checksums, a.checksums
            ));
        }
    }
    Ok(())
}

/// [`compare_components`] for system server jars, also comparing classpath membership.
pub fn compare_system_server_components(
    expected: &[SystemServerComponent],
    actual: &[SystemServerComponent],
) -> Result<(), String> {
    if expected.len() != actual.len() {
        return Err(format!(
            "system server component count differs ({} != {})",
            expected.len(),
            actual.len()
        ));
    }
    for (e, a) in expected.iter().zip(actual) {
        compare_components(
            std::slice::from_ref(&e.component),
            std::slice::from_ref(&a.component),
        )?;
        if e.is_in_classpath != a.is_in_classpath {
            return Err(format!(
                "classpath membership differs for {} ({} != {})",
                e.component.file, e.is_in_classpath, a.is_in_classpath
            ));
        }
    }
    Ok(())
}

/// System server jars whose contents changed while the list itself did not.
///
/// Returns `None` when paths, order or classpath membership differ; every
/// jar's context may have changed then.
pub fn changed_system_server_jars(
    expected: &[SystemServerComponent],
    actual: &[SystemServerComponent],
) -> Option<Vec<String>> {
    if expected.len() != actual.len() {
        return None;
    }
    let mut changed = Vec::new();
    for (e, a) in expected.iter().zip(actual) {
        if e.component.file != a.component.file || e.is_in_classpath != a.is_in_classpath {
            return None;
        }
        if e.component != a.component {
            changed.push(a.component.file.clone());
        }
    }
    Some(changed)
}

/// Returns `true` if `path` exists and is a regular file.
pub fn is_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|m| m.is_file())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use std::fs;

    /// Write a stored zip holding one `classes*.dex` entry per payload.
    pub(crate) fn write_jar(path: &Path, dex_payloads: &[&[u8]]) {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (i, data) in dex_payloads.iter().enumerate() {
            let name = odrefresh_dexsum::multidex_entry_name(i);
            let crc = crc32fast::hash(data);
            let offset = out.len() as u32;
            let len = (data.len() as u32).to_le_bytes();

            out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&len);
            out.extend_from_slice(&len);
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&len);
            central.extend_from_slice(&len);
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0u8; 12]);
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(dex_payloads.len() as u16).to_le_bytes());
        out.extend_from_slice(&(dex_payloads.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&[0, 0]);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, out).unwrap();
    }

    fn component(file: &str, size: u64, checksums: &str) -> Component {
        Component {
            file: file.to_string(),
            size,
            checksums: checksums.to_string(),
        }
    }

    #[test]
    fn jar_checksums_are_colon_joined_crcs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let jar = dir.path().join("a.jar");
        write_jar(&jar, &[b"one", b"two"]);

        let c = fingerprint(&cfg, jar.to_str().unwrap()).unwrap();
        let expected = format!("{:08x}:{:08x}", crc32fast::hash(b"one"), crc32fast::hash(b"two"));
        assert_eq!(c.checksums, expected);
        assert_eq!(c.size, fs::metadata(&jar).unwrap().len());
    }

    #[test]
    fn raw_dex_uses_header_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let dex = dir.path().join("classes.dex");
        let mut data = b"dex\n039\0".to_vec();
        data.extend_from_slice(&0x0102_0304u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 100]);
        fs::write(&dex, data).unwrap();

        let c = fingerprint(&cfg, dex.to_str().unwrap()).unwrap();
        assert_eq!(c.checksums, "01020304");
    }

    #[test]
    fn one_missing_file_fails_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let jar = dir.path().join("a.jar");
        write_jar(&jar, &[b"x"]);
        let jars = vec![
            jar.display().to_string(),
            dir.path().join("missing.jar").display().to_string(),
        ];
        let err = fingerprint_all(&cfg, &jars).unwrap_err();
        assert!(matches!(err, OdrError::Io { .. }));
    }

    #[test]
    fn garbage_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let f = dir.path().join("junk.jar");
        fs::write(&f, b"not a jar at all").unwrap();
        assert!(fingerprint(&cfg, f.to_str().unwrap()).is_err());
    }

    #[test]
    fn size_difference_is_reported_before_checksums() {
        let a = [component("/a.jar", 10, "aaaa")];
        let b = [component("/a.jar", 11, "bbbb")];
        let reason = compare_components(&a, &b).unwrap_err();
        assert!(reason.starts_with("size differs"), "{reason}");
    }

    #[test]
    fn truncated_or_reordered_lists_mismatch() {
        let list = [component("/a.jar", 1, "1"), component("/b.jar", 2, "2")];
        assert!(compare_components(&list, &list[..1]).is_err());
        let reordered = [list[1].clone(), list[0].clone()];
        assert!(compare_components(&list, &reordered).is_err());
        assert!(compare_components(&list, &list).is_ok());
    }

    #[test]
    fn classpath_flag_drift_alone_is_a_mismatch() {
        let c = component("/s.jar", 1, "1");
        let a = [SystemServerComponent { component: c.clone(), is_in_classpath: true }];
        let b = [SystemServerComponent { component: c, is_in_classpath: false }];
        let reason = compare_system_server_components(&a, &b).unwrap_err();
        assert!(reason.contains("classpath membership"), "{reason}");
    }

    #[test]
    fn content_changes_are_reported_per_jar() {
        let ss = |file: &str, size, cp| SystemServerComponent {
            component: component(file, size, "1"),
            is_in_classpath: cp,
        };
        let before = [ss("/a.jar", 1, true), ss("/b.jar", 2, true), ss("/s.jar", 3, false)];
        let after = [ss("/a.jar", 1, true), ss("/b.jar", 5, true), ss("/s.jar", 3, false)];
        assert_eq!(changed_system_server_jars(&before, &after), Some(vec!["/b.jar".to_string()]));

        let moved = [ss("/a.jar", 1, true), ss("/b.jar", 2, false), ss("/s.jar", 3, false)];
        assert_eq!(changed_system_server_jars(&before, &moved), None);
        assert_eq!(changed_system_server_jars(&before, &before[..2]), None);
    }
}
