//! Shared-library ABI selection.
//!
//! Sibling concern to the SSH pipeline: site hooks that bind-mount host
//! libraries into a container need to pick, among several host candidates,
//! the one that is ABI-compatible with the library the image was built
//! against. The policy: prefer an exact match; otherwise the newest
//! candidate not newer than the target (never downgrading the major, nor
//! the patch within the same major.minor); otherwise the oldest candidate
//! with equal major and strictly greater minor. The major version is never
//! downgraded.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Result};

/// A shared library name decomposed into linker name and ABI version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLibrary {
    path: String,
    linker_name: String,
    major: Option<u32>,
    minor: Option<u32>,
    patch: Option<u32>,
}

/// Whether `file` names a shared library (`libfoo.so` or `libfoo.so.X...`),
/// as opposed to e.g. `ld.so.conf` or `ld.so.cache`.
pub fn is_shared_lib(file: &Utf8Path) -> bool {
    let Some(name) = file.file_name() else {
        return false;
    };
    if name.ends_with(".conf") || name.ends_with(".cache") {
        return false;
    }
    match name.rfind(".so") {
        None => false,
        Some(pos) => {
            let rest = &name[pos + 3..];
            rest.is_empty() || rest.starts_with('.')
        }
    }
}

/// The name the dynamic linker is asked for, i.e. the filename truncated
/// after `.so`.
pub fn linker_name(path: &Utf8Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| eyre!("Library path {path} has no filename"))?;
    if !is_shared_lib(path) {
        return Err(eyre!(
            "Failed to parse linker name from invalid library path {path}"
        ));
    }
    let pos = name.rfind(".so").expect("checked by is_shared_lib");
    Ok(name[..pos + 3].to_string())
}

/// The dotted version components following `.so.`, empty for an unversioned
/// library.
pub fn parse_abi(path: &Utf8Path) -> Result<Vec<u32>> {
    if !is_shared_lib(path) {
        return Err(eyre!("Cannot parse ABI version of {path}: not a shared library"));
    }
    let name = path.file_name().expect("checked by is_shared_lib");
    let pos = name.rfind(".so").expect("checked by is_shared_lib");
    let rest = &name[pos + 3..];
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    rest[1..]
        .split('.')
        .map(|tok| {
            tok.parse()
                .map_err(|_| eyre!("Invalid ABI component {tok:?} in library name {name}"))
        })
        .collect()
}

impl SharedLibrary {
    pub fn new(path: &Utf8Path) -> Result<Self> {
        let linker_name = linker_name(path)?;
        let abi = parse_abi(path)?;
        Ok(Self {
            path: path.to_string(),
            linker_name,
            major: abi.first().copied(),
            minor: abi.get(1).copied(),
            patch: abi.get(2).copied(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        Utf8Path::new(&self.path)
    }

    pub fn linker_name(&self) -> &str {
        &self.linker_name
    }

    /// `libfoo.so.1.2.3` carries a version; bare `libfoo.so` does not.
    pub fn has_major_version(&self) -> bool {
        self.major.is_some()
    }

    /// The versioned filename, e.g. `libfoo.so.1.2`.
    pub fn real_name(&self) -> String {
        let mut name = self.linker_name.clone();
        for part in [self.major, self.minor, self.patch].into_iter().flatten() {
            name.push('.');
            name.push_str(&part.to_string());
        }
        name
    }

    /// Full compatibility: a container linking `target` can use this library
    /// when the linker names and majors match and this minor is not newer.
    pub fn is_full_abi_compatible(&self, target: &SharedLibrary) -> bool {
        self.linker_name == target.linker_name
            && self.major == target.major
            && self.minor <= target.minor
    }

    /// Major-only compatibility.
    pub fn is_major_abi_compatible(&self, target: &SharedLibrary) -> bool {
        self.linker_name == target.linker_name && self.major == target.major
    }

    /// Pick the best replacement for `self` among `candidates`: an exact
    /// match, else the newest same-major candidate not newer than `self`,
    /// else the oldest same-major candidate with a newer minor. The major is
    /// only left when no same-major candidate exists at all.
    pub fn pick_newest_abi_compatible<'a>(
        &self,
        candidates: &'a [SharedLibrary],
    ) -> Result<&'a SharedLibrary> {
        let [first, rest @ ..] = candidates else {
            return Err(eyre!("Received no candidate libraries to pick from"));
        };
        if rest.is_empty() {
            return Ok(first);
        }
        if let Some(c) = candidates.iter().find(|c| c.real_name() == self.real_name()) {
            return Ok(c);
        }

        let version = |c: &SharedLibrary| (c.minor, c.patch);

        // Newest of the same-major candidates older or equal to us; picking
        // the maximum patch at a given minor also rules out a patch
        // downgrade within the same major.minor.
        if let Some(c) = candidates
            .iter()
            .filter(|c| c.major == self.major && c.minor <= self.minor)
            .max_by_key(|c| version(c))
        {
            return Ok(c);
        }

        // Oldest of the same-major candidates newer than us.
        if let Some(c) = candidates
            .iter()
            .filter(|c| c.major == self.major)
            .min_by_key(|c| version(c))
        {
            return Ok(c);
        }

        // No candidate shares our major: never downgrade it, so prefer the
        // oldest newer-major candidate over the newest older-major one.
        candidates
            .iter()
            .filter(|c| c.major > self.major)
            .min_by_key(|c| (c.major, c.minor, c.patch))
            .or_else(|| candidates.iter().max_by_key(|c| (c.major, c.minor, c.patch)))
            .ok_or_else(|| eyre!("Received no candidate libraries to pick from"))
    }
}
