//! Effective user id handling for setuid installations.
//!
//! The card driver needs elevated rights, so the pulser may be installed setuid. In that case
//! it runs with the real user's rights and raises them only around hardware calls, through a
//! [`PrivilegeGuard`] that restores the real user id when dropped. Without setuid (real and
//! effective user id equal) the guard does nothing.

use log::error;

use crate::error::{CtrlError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Privileges {
    real: libc::uid_t,
    elevated: libc::uid_t,
}

impl Privileges {
    /// Captures the user ids of the process and drops to the real user id.
    pub fn acquire() -> Result<Self> {
        let (real, elevated) = unsafe { (libc::getuid(), libc::geteuid()) };
        let privileges = Self { real, elevated };
        if privileges.is_setuid() {
            set_euid(real)?;
        }
        Ok(privileges)
    }

    pub fn is_setuid(&self) -> bool {
        self.real != self.elevated
    }

    pub fn raise(&self) -> Result<PrivilegeGuard> {
        PrivilegeGuard::new(*self)
    }
}

fn set_euid(uid: libc::uid_t) -> Result<()> {
    if unsafe { libc::seteuid(uid) } != 0 {
        return Err(CtrlError::Privilege(format!(
            "seteuid({uid}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Elevated rights for as long as the guard lives.
#[must_use]
pub struct PrivilegeGuard {
    privileges: Privileges,
}

impl PrivilegeGuard {
    fn new(privileges: Privileges) -> Result<Self> {
        if privileges.is_setuid() {
            set_euid(privileges.elevated)?;
        }
        Ok(Self { privileges })
    }
}

impl Drop for PrivilegeGuard {
    fn drop(&mut self) {
        if self.privileges.is_setuid() {
            if let Err(err) = set_euid(self.privileges.real) {
                error!("Failed to drop privileges: {err}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_restores_effective_uid() {
        let privileges = Privileges::acquire().unwrap();
        let before = unsafe { libc::geteuid() };
        {
            let _guard = privileges.raise().unwrap();
        }
        assert_eq!(unsafe { libc::geteuid() }, before);
        assert_eq!(before, unsafe { libc::getuid() });
    }
}
