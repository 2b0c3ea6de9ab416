//! Privilege reduction primitives for the daemon child.
//!
//! These run between fork and exec, so everything here returns
//! `io::Result` and stays clear of allocation and locking.

use std::io;

/// Drop the entire capability bounding set.
///
/// The highest valid capability index depends on the running kernel, so the
/// loop walks indices from zero until prctl(2) rejects one with EINVAL; any
/// other failure is fatal.
pub fn drop_bounding_set() -> io::Result<()> {
    let mut cap: libc::c_ulong = 0;
    loop {
        // SAFETY: PR_CAPBSET_DROP only removes entries from the calling
        // process's bounding set.
        let ret = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINVAL) {
                // Walked past the last capability the kernel knows about.
                return Ok(());
            }
            return Err(err);
        }
        cap += 1;
    }
}

/// Set the no_new_privs flag: no exec from here on can grant privileges
/// through file modes or capabilities.
pub fn set_no_new_privs() -> io::Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS with these arguments only toggles the
    // calling process's flag.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
