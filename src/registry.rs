//! Probe registry: static bidirectional mapping between object subtypes
//! and probe descriptors.
//!
//! The descriptor table is compiled in. Two derived indices — sorted by
//! subtype id and by subtype name — are built exactly once on first use
//! behind an [`OnceLock`], no matter how many threads race there; every
//! later lookup is a lock-free binary search. The two indices are built
//! from the same table in one pass, which is what keeps them consistent.

use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::model::SubtypeId;

/// How a probe is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Handled by a function inside this process.
    InProcess,
    /// Handled by a separate worker process executable.
    ExternalProcess,
}

/// One entry of the static probe table.
#[derive(Debug, Clone, Copy)]
pub struct ProbeDescriptor {
    pub subtype: SubtypeId,
    /// Object subtype name as it appears in documents.
    pub subtype_name: &'static str,
    /// Probe executable (or handler) name.
    pub probe_name: &'static str,
    pub kind: ProbeKind,
}

/// Subtype id of the singleton system-info probe.
pub const SUBTYPE_SYSINFO: SubtypeId = SubtypeId(1);

macro_rules! external {
    ($id:expr, $subtype:expr, $probe:expr) => {
        ProbeDescriptor {
            subtype: SubtypeId($id),
            subtype_name: $subtype,
            probe_name: $probe,
            kind: ProbeKind::ExternalProcess,
        }
    };
}

/// The compiled-in probe table. Unsorted; order follows the original
/// grouping by object family.
static PROBE_TABLE: &[ProbeDescriptor] = &[
    external!(1, "system_info", "probe_system_info"),
    external!(10, "family", "probe_family"),
    external!(11, "filehash", "probe_filehash"),
    external!(12, "environmentvariable", "probe_environmentvariable"),
    external!(13, "textfilecontent54", "probe_textfilecontent54"),
    external!(14, "textfilecontent", "probe_textfilecontent"),
    external!(15, "variable", "probe_variable"),
    external!(16, "xmlfilecontent", "probe_xmlfilecontent"),
    external!(20, "dpkginfo", "probe_dpkginfo"),
    external!(21, "inetlisteningservers", "probe_inetlisteningservers"),
    external!(22, "rpminfo", "probe_rpminfo"),
    external!(23, "partition", "probe_partition"),
    external!(24, "iflisteners", "probe_iflisteners"),
    external!(25, "rpmverify", "probe_rpmverify"),
    external!(26, "selinuxboolean", "probe_selinuxboolean"),
    external!(30, "file", "probe_file"),
    external!(31, "interface", "probe_interface"),
    external!(32, "password", "probe_password"),
    external!(33, "process", "probe_process"),
    external!(34, "runlevel", "probe_runlevel"),
    external!(35, "shadow", "probe_shadow"),
    external!(36, "uname", "probe_uname"),
    external!(37, "xinetd", "probe_xinetd"),
    external!(38, "sysctl", "probe_sysctl"),
];

struct Indices {
    /// Sorted by subtype id.
    by_subtype: Vec<&'static ProbeDescriptor>,
    /// Sorted by subtype name.
    by_name: Vec<&'static ProbeDescriptor>,
}

static INDICES: OnceLock<Indices> = OnceLock::new();

fn indices() -> &'static Indices {
    INDICES.get_or_init(|| {
        let mut by_subtype: Vec<&'static ProbeDescriptor> = PROBE_TABLE.iter().collect();
        let mut by_name = by_subtype.clone();
        by_subtype.sort_by_key(|d| d.subtype);
        by_name.sort_by_key(|d| d.subtype_name);
        Indices { by_subtype, by_name }
    })
}

/// Resolve a subtype id to its subtype name.
pub fn subtype_to_name(subtype: SubtypeId) -> Option<&'static str> {
    let idx = indices();
    idx.by_subtype
        .binary_search_by_key(&subtype, |d| d.subtype)
        .ok()
        .map(|i| idx.by_subtype[i].subtype_name)
}

/// Resolve a subtype name to its id; [`SubtypeId::UNKNOWN`] on miss.
pub fn name_to_subtype(name: &str) -> SubtypeId {
    let idx = indices();
    idx.by_name
        .binary_search_by_key(&name, |d| d.subtype_name)
        .map(|i| idx.by_name[i].subtype)
        .unwrap_or(SubtypeId::UNKNOWN)
}

/// Full descriptor for a subtype id.
pub fn descriptor(subtype: SubtypeId) -> Option<&'static ProbeDescriptor> {
    let idx = indices();
    idx.by_subtype
        .binary_search_by_key(&subtype, |d| d.subtype)
        .ok()
        .map(|i| idx.by_subtype[i])
}

/// All descriptors in table order.
pub fn all() -> &'static [ProbeDescriptor] {
    PROBE_TABLE
}

// ---------------------------------------------------------------------------
// Probe directory listing
// ---------------------------------------------------------------------------

/// Environment variable naming the external probe directory.
pub const PROBE_DIR_ENV: &str = "DEFSCAN_PROBE_DIR";

const PROBE_DIR_DEFAULT: &str = "/usr/libexec/defscan";

/// Resolve the external probe directory.
pub fn probe_dir() -> PathBuf {
    std::env::var_os(PROBE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(PROBE_DIR_DEFAULT))
}

/// Listing options for [`list_probes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Also print the numeric subtype id and resolved executable path.
    pub verbose: bool,
    /// Skip external probes whose executable is not present and executable.
    pub check_access: bool,
}

fn is_executable(path: &std::path::Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Render the probe table to `output`, one probe per line: subtype name,
/// probe name, and an `E`/`.` external-process marker.
pub fn list_probes(output: &mut dyn Write, opts: ListOptions) -> std::io::Result<()> {
    let dir = probe_dir();

    for desc in PROBE_TABLE {
        let path = dir.join(desc.probe_name);

        if desc.kind == ProbeKind::ExternalProcess && opts.check_access {
            tracing::debug!(path = %path.display(), "checking probe access");
            if !is_executable(&path) {
                tracing::warn!(path = %path.display(), "probe not reachable");
                continue;
            }
        }

        let marker = match desc.kind {
            ProbeKind::ExternalProcess => 'E',
            ProbeKind::InProcess => '.',
        };

        write!(output, "{:<32} {:<32} {}", desc.subtype_name, desc.probe_name, marker)?;

        if opts.verbose {
            let shown = if desc.kind == ProbeKind::ExternalProcess {
                path.display().to_string()
            } else {
                String::new()
            };
            writeln!(output, " {:<5} {}", desc.subtype.0, shown)?;
        } else {
            writeln!(output)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_bijective() {
        for desc in all() {
            let name = subtype_to_name(desc.subtype).unwrap();
            assert_eq!(name, desc.subtype_name);
            assert_eq!(name_to_subtype(name), desc.subtype);
        }
    }

    #[test]
    fn unknown_lookups() {
        assert_eq!(subtype_to_name(SubtypeId(9999)), None);
        assert_eq!(name_to_subtype("no_such_probe"), SubtypeId::UNKNOWN);
    }

    #[test]
    fn indices_have_table_cardinality() {
        let idx = super::indices();
        assert_eq!(idx.by_subtype.len(), PROBE_TABLE.len());
        assert_eq!(idx.by_name.len(), PROBE_TABLE.len());
        // Sorted, no duplicates.
        assert!(idx.by_subtype.windows(2).all(|w| w[0].subtype < w[1].subtype));
        assert!(idx
            .by_name
            .windows(2)
            .all(|w| w[0].subtype_name < w[1].subtype_name));
    }

    #[test]
    fn concurrent_first_use_initializes_once() {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                std::thread::spawn(|| {
                    assert_eq!(name_to_subtype("file"), SubtypeId(30));
                    assert_eq!(subtype_to_name(SubtypeId(22)), Some("rpminfo"));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_detection() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe_file");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!is_executable(&path));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(is_executable(&path));

        // Directories never count, nor do missing paths.
        assert!(!is_executable(dir.path()));
        assert!(!is_executable(&dir.path().join("absent")));
    }

    #[test]
    fn listing_renders_every_probe_without_access_check() {
        let mut buf = Vec::new();
        list_probes(&mut buf, ListOptions::default()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), all().len());
        assert!(text.contains("rpminfo"));
        assert!(text.contains(" E"));
    }

    #[test]
    fn verbose_listing_includes_subtype_ids() {
        let mut buf = Vec::new();
        list_probes(
            &mut buf,
            ListOptions {
                verbose: true,
                check_access: false,
            },
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("30"));
        assert!(text.contains("probe_file"));
    }
}
