//! Multi-user identity arithmetic
//!
//! Android namespaces every app and shared-storage identity per user by
//! offsetting it with `userid * AID_USER_OFFSET`. These helpers are pure.

/// Android user index (0 is the primary user)
pub type UserId = u32;
/// Application id (the per-user part of an app uid)
pub type AppId = u32;
/// Unix uid
pub type Uid = u32;
/// Unix gid
pub type Gid = u32;

pub const AID_ROOT: Uid = 0;
/// Group allowed to write external storage
pub const AID_SDCARD_RW: Gid = 1015;
pub const AID_MEDIA_RW: Gid = 1023;
pub const AID_MEDIA_AUDIO: Gid = 1041;
pub const AID_MEDIA_VIDEO: Gid = 1056;
pub const AID_MEDIA_IMAGE: Gid = 1057;
/// Shared identity owning the volume-global OBB directory
pub const AID_MEDIA_OBB: Uid = 1059;

pub const AID_APP_START: AppId = 10000;
pub const AID_APP_END: AppId = 19999;
pub const AID_EXT_GID_START: Gid = 30000;
pub const AID_EXT_CACHE_GID_START: Gid = 40000;

/// Distance between two users' uid ranges
pub const AID_USER_OFFSET: Uid = 100000;

/// Combine a user index and a base identity into a multiuser uid/gid
pub fn multiuser_get_uid(userid: UserId, appid: AppId) -> Uid {
    userid
        .wrapping_mul(AID_USER_OFFSET)
        .wrapping_add(appid % AID_USER_OFFSET)
}

/// User index encoded in a multiuser uid
pub fn multiuser_get_user_id(uid: Uid) -> UserId {
    uid / AID_USER_OFFSET
}

/// Base identity encoded in a multiuser uid
pub fn multiuser_get_app_id(uid: Uid) -> AppId {
    uid % AID_USER_OFFSET
}

/// Whether `uid` belongs to an installed application
pub fn uid_is_app(uid: Uid) -> bool {
    let appid = multiuser_get_app_id(uid);
    (AID_APP_START..=AID_APP_END).contains(&appid)
}

/// External-storage group of an app uid
pub fn multiuser_get_ext_gid(uid: Uid) -> Gid {
    multiuser_get_uid(
        multiuser_get_user_id(uid),
        (multiuser_get_app_id(uid) - AID_APP_START) + AID_EXT_GID_START,
    )
}

/// External-storage cache group of an app uid
pub fn multiuser_get_ext_cache_gid(uid: Uid) -> Gid {
    multiuser_get_uid(
        multiuser_get_user_id(uid),
        (multiuser_get_app_id(uid) - AID_APP_START) + AID_EXT_CACHE_GID_START,
    )
}
