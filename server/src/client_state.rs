//! Client session state machine tables.

use shared::msgtypes::*;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientState {
    New,
    Anonymous,
    Authenticated,
    AvatarChooser,
    CreatingAvatar,
    SettingAvatar,
    PlayGame,
}

impl ClientState {
    /// Whether a client message type is handled in this state. Heartbeats and
    /// disconnects are valid everywhere.
    pub fn accepts(self, msg_type: u16) -> bool {
        if matches!(msg_type, CLIENT_HEARTBEAT | CLIENT_DISCONNECT) {
            return true;
        }
        let whitelist: &[u16] = match self {
            ClientState::New => &[CLIENT_LOGIN_2],
            ClientState::Anonymous => &[CLIENT_ADD_INTEREST, CLIENT_REMOVE_INTEREST],
            ClientState::Authenticated => &[CLIENT_GET_AVATARS, CLIENT_ADD_INTEREST, CLIENT_REMOVE_INTEREST],
            ClientState::AvatarChooser => &[
                CLIENT_GET_AVATARS,
                CLIENT_CREATE_AVATAR,
                CLIENT_SET_AVATAR,
                CLIENT_SET_WISHNAME,
                CLIENT_DELETE_AVATAR,
                CLIENT_REMOVE_INTEREST,
                CLIENT_OBJECT_UPDATE_FIELD,
            ],
            // The new avatar is named here before it is played.
            ClientState::CreatingAvatar => &[
                CLIENT_GET_AVATARS,
                CLIENT_SET_AVATAR,
                CLIENT_SET_WISHNAME,
                CLIENT_SET_NAME_PATTERN,
                CLIENT_OBJECT_UPDATE_FIELD,
            ],
            ClientState::SettingAvatar => &[CLIENT_OBJECT_UPDATE_FIELD],
            ClientState::PlayGame => &[
                CLIENT_ADD_INTEREST,
                CLIENT_REMOVE_INTEREST,
                CLIENT_GET_FRIEND_LIST,
                CLIENT_OBJECT_LOCATION,
                CLIENT_OBJECT_UPDATE_FIELD,
                CLIENT_SET_AVATAR,
            ],
        };
        whitelist.contains(&msg_type)
    }

    pub fn can_transition(self, to: ClientState) -> bool {
        use ClientState::*;
        self == to
            || matches!(
                (self, to),
                (New, Anonymous)
                    | (New, Authenticated)
                    | (Authenticated, AvatarChooser)
                    | (AvatarChooser, CreatingAvatar)
                    | (AvatarChooser, SettingAvatar)
                    | (CreatingAvatar, AvatarChooser)
                    | (CreatingAvatar, SettingAvatar)
                    | (SettingAvatar, PlayGame)
                    | (SettingAvatar, AvatarChooser)
                    | (PlayGame, AvatarChooser)
            )
    }

    /// Before an avatar is chosen, interest is limited to the root object.
    pub fn limited_interest(self) -> bool {
        self <= ClientState::Authenticated
    }

    /// Only uberdogs may be updated while the client has no avatar.
    pub fn uberdog_updates_only(self) -> bool {
        matches!(
            self,
            ClientState::AvatarChooser | ClientState::CreatingAvatar | ClientState::SettingAvatar
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::New => "NEW",
            ClientState::Anonymous => "ANONYMOUS",
            ClientState::Authenticated => "AUTHENTICATED",
            ClientState::AvatarChooser => "AVATAR_CHOOSER",
            ClientState::CreatingAvatar => "CREATING_AVATAR",
            ClientState::SettingAvatar => "SETTING_AVATAR",
            ClientState::PlayGame => "PLAY_GAME",
        };
        f.write_str(name)
    }
}

/// `CLIENT_GO_GET_LOST` reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DisconnectReason {
    InternalError = 1,
    Relogged = 100,
    ChatError = 120,
    LoginError = 122,
    OutdatedClient = 127,
    AdminKick = 151,
    AccountSuspended = 152,
    ShardDisconnect = 153,
}

impl DisconnectReason {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => DisconnectReason::InternalError,
            100 => DisconnectReason::Relogged,
            120 => DisconnectReason::ChatError,
            122 => DisconnectReason::LoginError,
            127 => DisconnectReason::OutdatedClient,
            151 => DisconnectReason::AdminKick,
            152 => DisconnectReason::AccountSuspended,
            153 => DisconnectReason::ShardDisconnect,
            _ => return None,
        })
    }
}
