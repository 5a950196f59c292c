//! System property snapshot.
//!
//! Compiled artifacts depend on a handful of runtime properties. The snapshot
//! keeps exactly those, so that a change in any of them can be detected by
//! comparing against the copy stored in the cache manifest.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Property name prefixes whose keys are all tracked.
pub const TRACKED_PREFIXES: &[&str] = &["dalvik.vm.", "ro.dalvik.vm."];

/// Keys under a tracked prefix that never influence compiled output.
pub const IGNORED_PROPERTIES: &[&str] = &[
    "dalvik.vm.dex2oat-cpu-set",
    "dalvik.vm.dex2oat-threads",
    "dalvik.vm.boot-dex2oat-cpu-set",
    "dalvik.vm.boot-dex2oat-threads",
    "dalvik.vm.restore-dex2oat-cpu-set",
    "dalvik.vm.restore-dex2oat-threads",
    "dalvik.vm.background-dex2oat-cpu-set",
    "dalvik.vm.background-dex2oat-threads",
];

/// An individually tracked flag and the value it takes when unset.
#[derive(Clone, Copy, Debug)]
pub struct TrackedFlag {
    /// Full property name.
    pub name: &'static str,
    /// Value the system image was built with.
    pub default: &'static str,
}

/// Flags outside the tracked prefixes that still affect compilation.
pub const TRACKED_FLAGS: &[TrackedFlag] = &[
    TrackedFlag {
        name: "persist.device_config.runtime_native_boot.force_disable_uffd_gc",
        default: "false",
    },
    TrackedFlag {
        name: "persist.device_config.runtime_native_boot.disable_compact_dex",
        default: "false",
    },
    TrackedFlag {
        name: "persist.device_config.runtime_native_boot.systemservercompilerfilter_override",
        default: "",
    },
    TrackedFlag {
        name: "persist.device_config.runtime_native_boot.odrefresh_test_toggle",
        default: "false",
    },
];

/// Build-time flag announcing the userfaultfd GC.
pub const BUILD_UFFD_GC: &str = "ro.dalvik.vm.enable_uffd_gc";

/// Filter used for system server jars.
pub const SYSTEM_SERVER_FILTER: &str = "dalvik.vm.systemservercompilerfilter";

/// Explicit filter for boot images; empty means profile-guided.
pub const BOOT_IMAGE_FILTER: &str = "dalvik.vm.boot-image-compiler-filter";

/// Compiler thread count for boot-time compilation.
pub const BOOT_DEX2OAT_THREADS: &str = "dalvik.vm.boot-dex2oat-threads";

/// Comma-separated CPU ids the compiler may run on during boot.
pub const BOOT_DEX2OAT_CPU_SET: &str = "dalvik.vm.boot-dex2oat-cpu-set";

/// Tracked property values, ordered by key.
pub type PropertySnapshot = BTreeMap<String, String>;

/// Parse `key=value` lines. Blank lines and `#` comments are skipped.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Read every property from a `key=value` file.
pub fn read_properties(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read properties from {}", path.display()))?;
    Ok(parse_properties(&text))
}

/// Reduce the full property set to the tracked snapshot.
///
/// Prefix-matched keys are copied as-is minus the ignore list. Explicit flags
/// are always present, filled with their default when unset or empty, so that
/// going from "unset" to "default" is not a change.
pub fn snapshot(all: &BTreeMap<String, String>) -> PropertySnapshot {
    let mut snap: PropertySnapshot = all
        .iter()
        .filter(|(k, _)| TRACKED_PREFIXES.iter().any(|p| k.starts_with(p)))
        .filter(|(k, _)| !IGNORED_PROPERTIES.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for flag in TRACKED_FLAGS {
        let value = all
            .get(flag.name)
            .filter(|v| !v.is_empty())
            .map_or(flag.default, String::as_str);
        snap.insert(flag.name.to_string(), value.to_string());
    }
    snap
}

/// Interpret a property as a boolean the way the platform does.
pub fn get_bool(props: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    match props.get(key).map(String::as_str) {
        Some("1" | "y" | "yes" | "on" | "true") => true,
        Some("0" | "n" | "no" | "off" | "false") => false,
        _ => default,
    }
}

/// A positive integer property; anything else reads as unset.
pub fn get_positive(props: &BTreeMap<String, String>, key: &str) -> Option<u32> {
    props
        .get(key)
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&n| n >= 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let parsed = parse_properties("# header\n\ndalvik.vm.foo = bar\nnot a property\n");
        assert_eq!(parsed, props(&[("dalvik.vm.foo", "bar")]));
    }

    #[test]
    fn snapshot_keeps_prefixes_and_drops_ignored() {
        let snap = snapshot(&props(&[
            ("dalvik.vm.usejit", "true"),
            ("ro.dalvik.vm.enable_uffd_gc", "false"),
            ("dalvik.vm.dex2oat-threads", "4"),
            ("ro.build.type", "user"),
        ]));
        assert_eq!(snap.get("dalvik.vm.usejit").map(String::as_str), Some("true"));
        assert!(snap.contains_key("ro.dalvik.vm.enable_uffd_gc"));
        assert!(!snap.contains_key("dalvik.vm.dex2oat-threads"));
        assert!(!snap.contains_key("ro.build.type"));
    }

    #[test]
    fn explicit_flags_default_when_unset_or_empty() {
        let unset = snapshot(&BTreeMap::new());
        let empty = snapshot(&props(&[(TRACKED_FLAGS[0].name, "")]));
        assert_eq!(unset, empty);
        assert_eq!(unset.get(TRACKED_FLAGS[0].name).map(String::as_str), Some("false"));
        assert_eq!(unset.len(), TRACKED_FLAGS.len());
    }

    #[test]
    fn bool_parsing_falls_back_to_default() {
        let p = props(&[("a", "1"), ("b", "off"), ("c", "maybe")]);
        assert!(get_bool(&p, "a", false));
        assert!(!get_bool(&p, "b", true));
        assert!(get_bool(&p, "c", true));
        assert!(!get_bool(&p, "missing", false));
    }

    #[test]
    fn thread_count_must_be_positive() {
        let p = props(&[("a", "4"), ("b", "0"), ("c", "-2"), ("d", "many")]);
        assert_eq!(get_positive(&p, "a"), Some(4));
        assert_eq!(get_positive(&p, "b"), None);
        assert_eq!(get_positive(&p, "c"), None);
        assert_eq!(get_positive(&p, "d"), None);
        assert_eq!(get_positive(&p, "missing"), None);
    }
}
