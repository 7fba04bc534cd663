//! Group-based access control for restricted interfaces.
//!
//! A server registered with a group id may only be attached by root or by
//! users that are members of that OS group. Membership lookup sits behind a
//! trait so the registry logic stays testable without real `/etc/group`
//! state.

use std::ffi::CStr;

use switchboard_types::{UNKNOWN_GROUP_ID, UNKNOWN_USER_ID};

/// Resolves whether a uid belongs to a group.
pub trait GroupAccess: Send {
    fn is_member(&self, uid: u32, gid: u32) -> bool;
}

/// Decides whether `uid` may attach to an interface restricted to `gid`.
///
/// Unrestricted interfaces admit everyone; root is always admitted; a
/// caller without credentials (TCP peers) is never admitted to a
/// restricted interface.
pub fn check_access(groups: &dyn GroupAccess, uid: u32, gid: u32) -> bool {
    if gid == UNKNOWN_GROUP_ID {
        return true;
    }
    if uid == UNKNOWN_USER_ID {
        return false;
    }
    if uid == 0 {
        return true;
    }
    groups.is_member(uid, gid)
}

/// Membership lookup against the real user database via libc.
#[derive(Debug, Default)]
pub struct SystemGroups;

impl GroupAccess for SystemGroups {
    fn is_member(&self, uid: u32, gid: u32) -> bool {
        for name in group_member_names(gid) {
            if uid_of_user(&name) == Some(uid) {
                return true;
            }
        }
        false
    }
}

fn group_member_names(gid: u32) -> Vec<String> {
    let mut buf = vec![0u8; 4096];
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrgid_r(
            gid,
            &mut grp,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Vec::new();
    }

    let mut names = Vec::new();
    let mut member = grp.gr_mem;
    unsafe {
        while !member.is_null() && !(*member).is_null() {
            if let Ok(name) = CStr::from_ptr(*member).to_str() {
                names.push(name.to_owned());
            }
            member = member.add(1);
        }
    }
    names
}

fn uid_of_user(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    let mut buf = vec![0u8; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some(pwd.pw_uid)
}

#[cfg(test)]
pub mod testing {
    use super::GroupAccess;
    use std::collections::HashSet;

    /// Map-backed membership for tests.
    #[derive(Debug, Default)]
    pub struct StaticGroups {
        members: HashSet<(u32, u32)>,
    }

    impl StaticGroups {
        pub fn with(members: &[(u32, u32)]) -> Self {
            Self {
                members: members.iter().copied().collect(),
            }
        }
    }

    impl GroupAccess for StaticGroups {
        fn is_member(&self, uid: u32, gid: u32) -> bool {
            self.members.contains(&(uid, gid))
        }
    }
}
