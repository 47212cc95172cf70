//! Reserved channels, well-known object ids and the channel packing formulas.

pub const STATESERVERS_CHANNEL: u64 = 4002;
pub const DBSERVERS_CHANNEL: u64 = 4003;
pub const CLIENTS_CHANNEL: u64 = 10;

pub const OTP_DO_ID_TOONTOWN: u32 = 4618;
pub const OTP_DO_ID_FRIEND_MANAGER: u32 = 4501;
pub const OTP_DO_ID_CENTRAL_LOGGER: u32 = 4688;

pub const OTP_ZONE_ID_MANAGEMENT: u32 = 2;
pub const OTP_ZONE_ID_DISTRICTS: u32 = 3;
pub const OTP_ZONE_ID_DISTRICTS_STATS: u32 = 4;

pub const ZONE_BITS: u32 = 16;
const PUPPET_PREFIX: u64 = 1001 << 32;
const ACCOUNT_PREFIX: u64 = 1003 << 32;

/// Broadcast channel for everything located at `(parent, zone)`.
pub fn location_as_channel(parent: u32, zone: u32) -> u64 {
    ((parent as u64) << ZONE_BITS) | zone as u64
}

/// Channel a child object listens on to hear about its parent.
pub fn parent_to_children(parent: u32) -> u64 {
    (1u64 << ZONE_BITS) | parent as u64
}

pub fn puppet_channel(av_id: u32) -> u64 {
    av_id as u64 + PUPPET_PREFIX
}

pub fn account_channel(disl_id: u32) -> u64 {
    disl_id as u64 + ACCOUNT_PREFIX
}

pub fn client_sender_channel(disl_id: u32, av_id: u32) -> u64 {
    ((disl_id as u64) << 32) | av_id as u64
}

pub fn account_id_from_channel(channel: u64) -> u32 {
    (channel >> 32) as u32
}

pub fn avatar_id_from_channel(channel: u64) -> u32 {
    (channel & 0xFFFF_FFFF) as u32
}
