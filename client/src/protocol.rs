//! Client protocol messages: request builders and typed server events.
//!
//! Client datagrams are `[u16 msg_type][payload]` with no routing header.
//! Object payloads (required and other fields) are left packed; decoding them
//! needs the schema and is up to the caller.

use crate::ClientError;
use shared::msgtypes::*;
use shared::{Datagram, DatagramIterator};

/// Version string sent at login unless the caller overrides it.
pub const DEFAULT_SERVER_VERSION: &str = "sv1.0.47.38";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarSummary {
    pub av_id: u32,
    pub name: String,
    pub dna: Vec<u8>,
    pub pos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendSummary {
    pub do_id: u32,
    pub name: String,
    pub dna: Vec<u8>,
    pub pet_id: u32,
}

/// A message from the client agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    LoginResponse {
        return_code: u8,
        error: String,
        username: String,
        server_secs: u32,
    },
    AvatarList {
        return_code: u8,
        avatars: Vec<AvatarSummary>,
    },
    CreateAvatarResponse {
        context: u16,
        return_code: u8,
        av_id: u32,
    },
    /// `pending` is always empty; names are approved or rejected at once.
    WishNameResponse {
        av_id: u32,
        return_code: u16,
        pending: String,
        approved: String,
        rejected: String,
    },
    NamePatternAnswer {
        av_id: u32,
        return_code: u8,
    },
    FriendList {
        error: u8,
        friends: Vec<FriendSummary>,
    },
    /// Our avatar entered the game; `data` is the owner view of its fields.
    AvatarDetails {
        av_id: u32,
        return_code: u8,
        data: Vec<u8>,
    },
    ObjectCreate {
        parent_id: u32,
        zone_id: u32,
        dclass: u16,
        do_id: u32,
        has_other: bool,
        data: Vec<u8>,
    },
    ObjectUpdate {
        do_id: u32,
        field: u16,
        data: Vec<u8>,
    },
    ObjectDisable {
        do_id: u32,
    },
    ObjectLocation {
        do_id: u32,
        parent_id: u32,
        zone_id: u32,
    },
    InterestDone {
        handle: u16,
        context: u32,
    },
    GoGetLost {
        code: u16,
        reason: String,
    },
    Heartbeat,
    /// Anything else, including forwarded friend and system messages.
    Other {
        msg_type: u16,
        data: Vec<u8>,
    },
}

impl ServerEvent {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClientError> {
        let mut dgi = DatagramIterator::new(bytes);
        let msg_type = dgi.get_uint16()?;

        let event = match msg_type {
            CLIENT_LOGIN_2_RESP => {
                let return_code = dgi.get_uint8()?;
                let error = dgi.get_string16()?;
                let username = dgi.get_string16()?;
                let _can_chat = dgi.get_uint8()?;
                let server_secs = dgi.get_uint32()?;
                ServerEvent::LoginResponse {
                    return_code,
                    error,
                    username,
                    server_secs,
                }
            }
            CLIENT_GET_AVATARS_RESP => {
                let return_code = dgi.get_uint8()?;
                let count = dgi.get_uint16()?;
                let mut avatars = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    avatars.push(AvatarSummary {
                        av_id: dgi.get_uint32()?,
                        name: dgi.get_string16()?,
                        dna: dgi.get_blob16()?.to_vec(),
                        pos: dgi.get_uint8()?,
                    });
                }
                ServerEvent::AvatarList { return_code, avatars }
            }
            CLIENT_CREATE_AVATAR_RESP => ServerEvent::CreateAvatarResponse {
                context: dgi.get_uint16()?,
                return_code: dgi.get_uint8()?,
                av_id: dgi.get_uint32()?,
            },
            CLIENT_SET_WISHNAME_RESP => ServerEvent::WishNameResponse {
                av_id: dgi.get_uint32()?,
                return_code: dgi.get_uint16()?,
                pending: dgi.get_string16()?,
                approved: dgi.get_string16()?,
                rejected: dgi.get_string16()?,
            },
            CLIENT_SET_NAME_PATTERN_ANSWER => ServerEvent::NamePatternAnswer {
                av_id: dgi.get_uint32()?,
                return_code: dgi.get_uint8()?,
            },
            CLIENT_GET_FRIEND_LIST_RESP => {
                let error = dgi.get_uint8()?;
                let count = dgi.get_uint16()?;
                let mut friends = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    friends.push(FriendSummary {
                        do_id: dgi.get_uint32()?,
                        name: dgi.get_string16()?,
                        dna: dgi.get_blob16()?.to_vec(),
                        pet_id: dgi.get_uint32()?,
                    });
                }
                ServerEvent::FriendList { error, friends }
            }
            CLIENT_GET_AVATAR_DETAILS_RESP => ServerEvent::AvatarDetails {
                av_id: dgi.get_uint32()?,
                return_code: dgi.get_uint8()?,
                data: dgi.remaining_bytes().to_vec(),
            },
            CLIENT_CREATE_OBJECT_REQUIRED | CLIENT_CREATE_OBJECT_REQUIRED_OTHER => ServerEvent::ObjectCreate {
                parent_id: dgi.get_uint32()?,
                zone_id: dgi.get_uint32()?,
                dclass: dgi.get_uint16()?,
                do_id: dgi.get_uint32()?,
                has_other: msg_type == CLIENT_CREATE_OBJECT_REQUIRED_OTHER,
                data: dgi.remaining_bytes().to_vec(),
            },
            CLIENT_OBJECT_UPDATE_FIELD => ServerEvent::ObjectUpdate {
                do_id: dgi.get_uint32()?,
                field: dgi.get_uint16()?,
                data: dgi.remaining_bytes().to_vec(),
            },
            CLIENT_OBJECT_DISABLE => ServerEvent::ObjectDisable {
                do_id: dgi.get_uint32()?,
            },
            CLIENT_OBJECT_LOCATION => ServerEvent::ObjectLocation {
                do_id: dgi.get_uint32()?,
                parent_id: dgi.get_uint32()?,
                zone_id: dgi.get_uint32()?,
            },
            CLIENT_DONE_INTEREST_RESP => ServerEvent::InterestDone {
                handle: dgi.get_uint16()?,
                context: dgi.get_uint32()?,
            },
            CLIENT_GO_GET_LOST => ServerEvent::GoGetLost {
                code: dgi.get_uint16()?,
                reason: dgi.get_string16()?,
            },
            CLIENT_HEARTBEAT => ServerEvent::Heartbeat,
            _ => ServerEvent::Other {
                msg_type,
                data: dgi.remaining_bytes().to_vec(),
            },
        };
        Ok(event)
    }
}

/// `CLIENT_LOGIN_2(play_token, server_version, hash, token_type, want_magic_words)`
pub fn login(play_token: &str, server_version: &str) -> Result<Vec<u8>, ClientError> {
    let mut dg = Datagram::client(CLIENT_LOGIN_2);
    dg.add_string16(play_token)?;
    dg.add_string16(server_version)?;
    dg.add_uint32(0);
    dg.add_int32(1);
    dg.add_string16("")?;
    Ok(dg.into_bytes())
}

pub fn get_avatars() -> Vec<u8> {
    Datagram::client(CLIENT_GET_AVATARS).into_bytes()
}

pub fn create_avatar(dna: &[u8], pos: u8) -> Result<Vec<u8>, ClientError> {
    let mut dg = Datagram::client(CLIENT_CREATE_AVATAR);
    dg.add_blob16(dna)?;
    dg.add_uint8(pos);
    Ok(dg.into_bytes())
}

/// Zero leaves the game.
pub fn set_avatar(av_id: u32) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_SET_AVATAR);
    dg.add_uint32(av_id);
    dg.into_bytes()
}

/// An `av_id` of zero only checks the name.
pub fn set_wishname(av_id: u32, name: &str) -> Result<Vec<u8>, ClientError> {
    let mut dg = Datagram::client(CLIENT_SET_WISHNAME);
    dg.add_uint32(av_id);
    dg.add_string16(name)?;
    Ok(dg.into_bytes())
}

/// Four `(index, flag)` parts: title, first name, last name prefix and suffix.
pub fn set_name_pattern(av_id: u32, parts: [(i16, i16); 4]) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_SET_NAME_PATTERN);
    dg.add_uint32(av_id);
    for (index, flag) in parts {
        dg.add_int16(index);
        dg.add_int16(flag);
    }
    dg.into_bytes()
}

/// Answered with a fresh `AvatarList`.
pub fn delete_avatar(av_id: u32) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_DELETE_AVATAR);
    dg.add_uint32(av_id);
    dg.into_bytes()
}

pub fn get_friend_list() -> Vec<u8> {
    Datagram::client(CLIENT_GET_FRIEND_LIST).into_bytes()
}

pub fn add_interest(handle: u16, context: u32, parent_id: u32, zones: &[u32]) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_ADD_INTEREST);
    dg.add_uint16(handle);
    dg.add_uint32(context);
    dg.add_uint32(parent_id);
    for zone in zones {
        dg.add_uint32(*zone);
    }
    dg.into_bytes()
}

/// Without a context the server sends no `DONE_INTEREST_RESP`.
pub fn remove_interest(handle: u16, context: Option<u32>) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_REMOVE_INTEREST);
    dg.add_uint16(handle);
    if let Some(context) = context {
        dg.add_uint32(context);
    }
    dg.into_bytes()
}

/// `payload` is the field's packed arguments.
pub fn update_field(do_id: u32, field: u16, payload: &[u8]) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_OBJECT_UPDATE_FIELD);
    dg.add_uint32(do_id);
    dg.add_uint16(field);
    dg.add_bytes(payload);
    dg.into_bytes()
}

pub fn object_location(do_id: u32, parent_id: u32, zone_id: u32) -> Vec<u8> {
    let mut dg = Datagram::client(CLIENT_OBJECT_LOCATION);
    dg.add_uint32(do_id);
    dg.add_uint32(parent_id);
    dg.add_uint32(zone_id);
    dg.into_bytes()
}

pub fn heartbeat() -> Vec<u8> {
    Datagram::client(CLIENT_HEARTBEAT).into_bytes()
}

pub fn disconnect() -> Vec<u8> {
    Datagram::client(CLIENT_DISCONNECT).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_avatar_list() {
        let mut dg = Datagram::client(CLIENT_GET_AVATARS_RESP);
        dg.add_uint8(0);
        dg.add_uint16(1);
        dg.add_uint32(100_000_001);
        dg.add_string16("Flippy").unwrap();
        dg.add_blob16(&[1, 2, 3]).unwrap();
        dg.add_uint8(2);

        let event = ServerEvent::parse(dg.bytes()).unwrap();
        assert_eq!(
            event,
            ServerEvent::AvatarList {
                return_code: 0,
                avatars: vec![AvatarSummary {
                    av_id: 100_000_001,
                    name: "Flippy".into(),
                    dna: vec![1, 2, 3],
                    pos: 2,
                }],
            }
        );
    }

    #[test]
    fn test_parse_object_create_keeps_payload() {
        let mut dg = Datagram::client(CLIENT_CREATE_OBJECT_REQUIRED_OTHER);
        dg.add_uint32(4618);
        dg.add_uint32(2000);
        dg.add_uint16(3);
        dg.add_uint32(500_001);
        dg.add_bytes(&[0xAB, 0xCD]);

        match ServerEvent::parse(dg.bytes()).unwrap() {
            ServerEvent::ObjectCreate {
                parent_id,
                zone_id,
                do_id,
                has_other,
                data,
                ..
            } => {
                assert_eq!((parent_id, zone_id, do_id), (4618, 2000, 500_001));
                assert!(has_other);
                assert_eq!(data, vec![0xAB, 0xCD]);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_go_get_lost_and_unknown() {
        let mut dg = Datagram::client(CLIENT_GO_GET_LOST);
        dg.add_uint16(122);
        dg.add_string16("Bad token.").unwrap();
        assert_eq!(
            ServerEvent::parse(dg.bytes()).unwrap(),
            ServerEvent::GoGetLost {
                code: 122,
                reason: "Bad token.".into()
            }
        );

        let mut dg = Datagram::client(CLIENT_FRIEND_ONLINE);
        dg.add_uint32(7);
        assert_eq!(
            ServerEvent::parse(dg.bytes()).unwrap(),
            ServerEvent::Other {
                msg_type: CLIENT_FRIEND_ONLINE,
                data: vec![7, 0, 0, 0]
            }
        );
    }

    #[test]
    fn test_parse_naming_answers() {
        let mut dg = Datagram::client(CLIENT_SET_WISHNAME_RESP);
        dg.add_uint32(100_000_001);
        dg.add_uint16(0);
        dg.add_string16("").unwrap();
        dg.add_string16("").unwrap();
        dg.add_string16("Toon!").unwrap();
        assert_eq!(
            ServerEvent::parse(dg.bytes()).unwrap(),
            ServerEvent::WishNameResponse {
                av_id: 100_000_001,
                return_code: 0,
                pending: String::new(),
                approved: String::new(),
                rejected: "Toon!".into(),
            }
        );

        let mut dg = Datagram::client(CLIENT_SET_NAME_PATTERN_ANSWER);
        dg.add_uint32(100_000_001);
        dg.add_uint8(1);
        assert_eq!(
            ServerEvent::parse(dg.bytes()).unwrap(),
            ServerEvent::NamePatternAnswer {
                av_id: 100_000_001,
                return_code: 1
            }
        );
    }

    #[test]
    fn test_parse_friend_list() {
        let mut dg = Datagram::client(CLIENT_GET_FRIEND_LIST_RESP);
        dg.add_uint8(0);
        dg.add_uint16(1);
        dg.add_uint32(100_000_002);
        dg.add_string16("Lil Oldman").unwrap();
        dg.add_blob16(&[7]).unwrap();
        dg.add_uint32(0);

        let ServerEvent::FriendList { error, friends } = ServerEvent::parse(dg.bytes()).unwrap() else {
            panic!("not a friend list");
        };
        assert_eq!(error, 0);
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].name, "Lil Oldman");
        assert_eq!(friends[0].pet_id, 0);
    }

    #[test]
    fn test_name_pattern_layout() {
        let bytes = set_name_pattern(5, [(0, 0), (3, 0), (-1, 0), (-1, 1)]);
        assert_eq!(bytes.len(), 2 + 4 + 16);
        let mut dgi = DatagramIterator::new(&bytes);
        assert_eq!(dgi.get_uint16().unwrap(), CLIENT_SET_NAME_PATTERN);
        assert_eq!(dgi.get_uint32().unwrap(), 5);
        dgi.skip(12).unwrap();
        assert_eq!(dgi.get_int16().unwrap(), -1);
        assert_eq!(dgi.get_int16().unwrap(), 1);
    }

    #[test]
    fn test_truncated_event_is_an_error() {
        assert!(ServerEvent::parse(&[CLIENT_OBJECT_DISABLE as u8, 0, 1]).is_err());
        assert!(ServerEvent::parse(&[]).is_err());
    }

    #[test]
    fn test_login_layout() {
        let bytes = login("alice", DEFAULT_SERVER_VERSION).unwrap();
        let mut dgi = DatagramIterator::new(&bytes);
        assert_eq!(dgi.get_uint16().unwrap(), CLIENT_LOGIN_2);
        assert_eq!(dgi.get_string16().unwrap(), "alice");
        assert_eq!(dgi.get_string16().unwrap(), DEFAULT_SERVER_VERSION);
        assert_eq!(dgi.get_uint32().unwrap(), 0);
        assert_eq!(dgi.get_int32().unwrap(), 1);
        assert_eq!(dgi.get_string16().unwrap(), "");
        assert_eq!(dgi.remaining(), 0);
    }

    #[test]
    fn test_remove_interest_context_is_optional() {
        assert_eq!(remove_interest(3, None).len(), 4);
        assert_eq!(remove_interest(3, Some(9)).len(), 8);
    }
}
