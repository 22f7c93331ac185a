//! Attributes the overlay reports for a node

use super::{DerivedState, PermissionClass};
use crate::config::MountConfig;
use crate::multiuser::{multiuser_get_uid, Gid, Uid, AID_SDCARD_RW};

/// Owner and mode shown on the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleAttrs {
    pub uid: Uid,
    pub gid: Gid,
    /// Full st_mode including file type bits
    pub mode: u32,
}

/// Synthesize overlay attributes from derived state and the lower mode.
///
/// Lower owner bits are fanned out to group and other, then filtered
/// through the mount mask and the class-specific visibility.
pub fn visible_attrs(state: &DerivedState, lower_mode: u32, config: &MountConfig) -> VisibleAttrs {
    let mut visible_mode = 0o775 & !config.mask;

    if state.class == PermissionClass::PreRoot {
        // Everyone must be able to traverse into their own user directory
        visible_mode = 0o711;
    } else if state.under_android {
        // Only apps of the owning user belong here; keep o+x for the
        // default view so paths stay traversable.
        if config.gid == AID_SDCARD_RW {
            visible_mode &= !0o006;
        } else {
            visible_mode &= !0o007;
        }
    }

    let owner_mode = lower_mode & 0o700;
    let filtered_mode = visible_mode & (owner_mode | (owner_mode >> 3) | (owner_mode >> 6));

    VisibleAttrs {
        uid: state.owner_uid,
        gid: multiuser_get_uid(state.owner_user, config.gid),
        mode: (lower_mode & libc::S_IFMT) | filtered_mode,
    }
}
