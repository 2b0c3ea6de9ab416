//! Parsing and rewriting of passwd databases.
//!
//! Used in two places: resolving the invoking user's name from the host
//! passwd file, and patching the shell field of the container's
//! `/etc/passwd`. There is no safe in-place byte patch for a line whose
//! length may change, so the file is parsed, mutated, and serialized as a
//! whole; entries that fail to parse abort the rewrite instead of being
//! silently dropped.

use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::{debug, trace};

/// One `name:password:uid:gid:gecos:home:shell` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    /// Empty when the entry carries no command interpreter.
    pub shell: String,
}

impl PasswdEntry {
    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        let &[name, password, uid, gid, gecos, home, shell] = fields.as_slice() else {
            return Err(eyre!(
                "Malformed passwd entry {line:?}: expected 7 colon-separated fields"
            ));
        };
        let uid = uid
            .parse()
            .map_err(|_| eyre!("Malformed passwd entry {line:?}: invalid uid {uid:?}"))?;
        let gid = gid
            .parse()
            .map_err(|_| eyre!("Malformed passwd entry {line:?}: invalid gid {gid:?}"))?;
        Ok(Self {
            name: name.to_string(),
            password: password.to_string(),
            uid,
            gid,
            gecos: gecos.to_string(),
            home: home.to_string(),
            shell: shell.to_string(),
        })
    }

    fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.name, self.password, self.uid, self.gid, self.gecos, self.home, self.shell
        )
    }
}

/// An ordered passwd database, preserving the source file's trailing-newline
/// convention across a rewrite.
#[derive(Debug, Clone)]
pub struct PasswdDb {
    entries: Vec<PasswdEntry>,
    trailing_newline: bool,
}

impl PasswdDb {
    pub fn parse(content: &str) -> Result<Self> {
        let trailing_newline = content.is_empty() || content.ends_with('\n');
        let entries = content
            .lines()
            .map(PasswdEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            entries,
            trailing_newline,
        })
    }

    pub fn load(path: &Utf8Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read passwd database {path}"))?;
        Self::parse(&content).with_context(|| format!("Failed to parse passwd database {path}"))
    }

    pub fn entries(&self) -> &[PasswdEntry] {
        &self.entries
    }

    /// Name of the entry with the given uid. The first match wins, as with
    /// getpwuid(3).
    pub fn username_of(&self, uid: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.uid == uid)
            .map(|e| e.name.as_str())
    }

    /// Home directory of the entry with the given uid.
    pub fn home_of(&self, uid: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.uid == uid)
            .map(|e| e.home.as_str())
    }

    /// Rewrite the shell field of every entry whose interpreter does not
    /// exist under `rootfs` to `/bin/sh`. Returns the number of entries
    /// patched; all other fields, entry order, and the newline convention
    /// are untouched.
    pub fn patch_missing_shells(&mut self, rootfs: &Utf8Path) -> usize {
        let mut patched = 0;
        for entry in &mut self.entries {
            if entry.shell.is_empty() {
                continue;
            }
            let shell_in_rootfs = crate::activate::join_rootfs(rootfs, &entry.shell);
            if !shell_in_rootfs.exists() {
                trace!(
                    "Rewriting shell of {} from {} to /bin/sh",
                    entry.name,
                    entry.shell
                );
                entry.shell = "/bin/sh".to_string();
                patched += 1;
            }
        }
        patched
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = write!(out, "{}", entry.render());
        }
        if self.trailing_newline && !self.entries.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Serialize to `path` via a temporary file in the same directory and an
    /// atomic rename, mode 0644.
    pub fn write_to(&self, path: &Utf8Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| eyre!("Passwd path {path} has no parent directory"))?;
        let tmp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temporary file in {parent}"))?;
        std::fs::write(tmp.path(), self.render())?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace {path}"))?;
        debug!("Wrote passwd database {path}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                          alice:x:1000:1000::/home/alice:/bin/bash\n";

    #[test]
    fn test_roundtrip_is_stable() {
        let db = PasswdDb::parse(SAMPLE).unwrap();
        assert_eq!(db.render(), SAMPLE);
        let reparsed = PasswdDb::parse(&db.render()).unwrap();
        assert_eq!(reparsed.entries(), db.entries());
    }

    #[test]
    fn test_no_trailing_newline_preserved() {
        let content = "root:x:0:0:root:/root:/bin/sh";
        let db = PasswdDb::parse(content).unwrap();
        assert_eq!(db.render(), content);
    }

    #[test]
    fn test_lookups() {
        let db = PasswdDb::parse(SAMPLE).unwrap();
        assert_eq!(db.username_of(1000), Some("alice"));
        assert_eq!(db.home_of(1000), Some("/home/alice"));
        assert_eq!(db.username_of(4242), None);
    }

    #[test]
    fn test_malformed_entry_is_refused() {
        assert!(PasswdDb::parse("root:x:0:0:root:/root\n").is_err());
        assert!(PasswdDb::parse("root:x:zero:0:root:/root:/bin/sh\n").is_err());
        assert!(PasswdDb::parse("+@netgroup\n").is_err());
    }

    #[test]
    fn test_patch_rewrites_only_missing_shells() {
        let rootfs_dir = tempfile::tempdir().unwrap();
        let rootfs = Utf8Path::from_path(rootfs_dir.path()).unwrap();
        std::fs::create_dir_all(rootfs.join("usr/sbin")).unwrap();
        std::fs::write(rootfs.join("usr/sbin/nologin"), "").unwrap();

        let mut db = PasswdDb::parse(SAMPLE).unwrap();
        // /bin/bash is absent from the rootfs, /usr/sbin/nologin is present.
        assert_eq!(db.patch_missing_shells(rootfs), 2);

        let rendered = db.render();
        assert_eq!(
            rendered,
            "root:x:0:0:root:/root:/bin/sh\n\
             daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
             alice:x:1000:1000::/home/alice:/bin/sh\n"
        );
    }

    #[test]
    fn test_patch_leaves_complete_file_unchanged() {
        let rootfs_dir = tempfile::tempdir().unwrap();
        let rootfs = Utf8Path::from_path(rootfs_dir.path()).unwrap();
        std::fs::create_dir_all(rootfs.join("bin")).unwrap();
        std::fs::write(rootfs.join("bin/bash"), "").unwrap();
        std::fs::create_dir_all(rootfs.join("usr/sbin")).unwrap();
        std::fs::write(rootfs.join("usr/sbin/nologin"), "").unwrap();

        let mut db = PasswdDb::parse(SAMPLE).unwrap();
        assert_eq!(db.patch_missing_shells(rootfs), 0);
        assert_eq!(db.render(), SAMPLE);
    }

    #[test]
    fn test_entry_without_shell_is_not_patched() {
        let rootfs_dir = tempfile::tempdir().unwrap();
        let rootfs = Utf8Path::from_path(rootfs_dir.path()).unwrap();

        let mut db = PasswdDb::parse("sync:x:4:65534:sync:/bin:\n").unwrap();
        assert_eq!(db.patch_missing_shells(rootfs), 0);
        assert_eq!(db.render(), "sync:x:4:65534:sync:/bin:\n");
    }

    #[test]
    fn test_write_to_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("passwd");
        std::fs::write(&path, "old").unwrap();

        let db = PasswdDb::parse(SAMPLE).unwrap();
        db.write_to(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
