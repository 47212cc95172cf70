//! Message type numbers, following the legacy OTP numbering.

// Control vocabulary, addressed to CONTROL_MESSAGE.
pub const CONTROL_MESSAGE: u64 = 4001;
pub const CONTROL_SET_CHANNEL: u16 = 2001;
pub const CONTROL_REMOVE_CHANNEL: u16 = 2002;
pub const CONTROL_ADD_RANGE: u16 = 2008;
pub const CONTROL_REMOVE_RANGE: u16 = 2009;
pub const CONTROL_ADD_POST_REMOVE: u16 = 2010;
pub const CONTROL_CLEAR_POST_REMOVE: u16 = 2011;

// Client protocol.
pub const CLIENT_GET_AVATARS: u16 = 3;
pub const CLIENT_GO_GET_LOST: u16 = 4;
pub const CLIENT_GET_AVATARS_RESP: u16 = 5;
pub const CLIENT_CREATE_AVATAR: u16 = 6;
pub const CLIENT_CREATE_AVATAR_RESP: u16 = 7;
pub const CLIENT_GET_FRIEND_LIST: u16 = 10;
pub const CLIENT_GET_FRIEND_LIST_RESP: u16 = 11;
pub const CLIENT_GET_AVATAR_DETAILS_RESP: u16 = 15;
pub const CLIENT_LOGIN_2: u16 = 16;
pub const CLIENT_LOGIN_2_RESP: u16 = 17;
pub const CLIENT_OBJECT_UPDATE_FIELD: u16 = 24;
pub const CLIENT_OBJECT_DISABLE: u16 = 25;
pub const CLIENT_SET_AVATAR: u16 = 32;
pub const CLIENT_CREATE_OBJECT_REQUIRED: u16 = 34;
pub const CLIENT_CREATE_OBJECT_REQUIRED_OTHER: u16 = 35;
pub const CLIENT_DISCONNECT: u16 = 37;
pub const CLIENT_DONE_INTEREST_RESP: u16 = 48;
pub const CLIENT_HEARTBEAT: u16 = 52;
pub const CLIENT_FRIEND_ONLINE: u16 = 53;
pub const CLIENT_FRIEND_OFFLINE: u16 = 54;
pub const CLIENT_DELETE_AVATAR: u16 = 56;
/// Same layout and number as `CLIENT_GET_AVATARS_RESP`.
pub const CLIENT_DELETE_AVATAR_RESP: u16 = CLIENT_GET_AVATARS_RESP;
pub const CLIENT_SET_NAME_PATTERN: u16 = 67;
pub const CLIENT_SET_NAME_PATTERN_ANSWER: u16 = 68;
pub const CLIENT_SET_WISHNAME: u16 = 70;
pub const CLIENT_SET_WISHNAME_RESP: u16 = 71;
pub const CLIENT_SYSTEM_MESSAGE: u16 = 78;
pub const CLIENT_ADD_INTEREST: u16 = 97;
pub const CLIENT_REMOVE_INTEREST: u16 = 99;
pub const CLIENT_OBJECT_LOCATION: u16 = 102;

// Database server.
pub const DBSERVER_CREATE_STORED_OBJECT: u16 = 1003;
pub const DBSERVER_CREATE_STORED_OBJECT_RESP: u16 = 1004;
pub const DBSERVER_DELETE_STORED_OBJECT: u16 = 1008;
pub const DBSERVER_GET_STORED_VALUES: u16 = 1012;
pub const DBSERVER_GET_STORED_VALUES_RESP: u16 = 1013;
pub const DBSERVER_SET_STORED_VALUES: u16 = 1014;
pub const DBSERVER_ACCOUNT_QUERY: u16 = 1020;
pub const DBSERVER_ACCOUNT_QUERY_RESP: u16 = 1021;
pub const DBSERVER_ACCOUNT_SET_AVATAR: u16 = 1022;
pub const DBSERVER_GET_FRIEND_LIST: u16 = 1030;
pub const DBSERVER_GET_FRIEND_LIST_RESP: u16 = 1031;

// State server.
pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED: u16 = 2001;
pub const STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER: u16 = 2003;
pub const STATESERVER_OBJECT_UPDATE_FIELD: u16 = 2004;
pub const STATESERVER_OBJECT_UPDATE_FIELD_MULTIPLE: u16 = 2005;
pub const STATESERVER_OBJECT_DELETE_RAM: u16 = 2007;
pub const STATESERVER_OBJECT_SET_ZONE: u16 = 2008;
pub const STATESERVER_OBJECT_CHANGE_ZONE: u16 = 2009;
pub const STATESERVER_QUERY_OBJECT_ALL: u16 = 2020;
pub const STATESERVER_QUERY_ZONE_OBJECT_ALL: u16 = 2021;
pub const STATESERVER_QUERY_OBJECT_ALL_RESP: u16 = 2030;
pub const STATESERVER_ADD_AI_RECV: u16 = 2045;
pub const STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE: u16 = 2046;
pub const STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT: u16 = 2050;
pub const STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT: u16 = 2051;
pub const STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP: u16 = 2052;
pub const STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT_RESP: u16 = 2053;
pub const STATESERVER_SHARD_RESET: u16 = 2061;
pub const STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER: u16 = 2066;
pub const STATESERVER_OBJECT_ENTER_AI_RECV: u16 = 2067;
pub const STATESERVER_OBJECT_ENTER_OWNER_RECV: u16 = 2068;
pub const STATESERVER_OBJECT_SET_OWNER_RECV: u16 = 2070;

// Client agent, addressed to a session channel by other services.
pub const CLIENT_AGENT_EJECT: u16 = 3004;
pub const CLIENT_AGENT_SET_INTEREST: u16 = 3008;
pub const CLIENT_AGENT_REMOVE_INTEREST: u16 = 3009;

/// Human readable name for log lines. Control and state server numbers
/// overlap, so names for 2001..2011 resolve to the state server meaning.
pub fn msg_name(msg_type: u16) -> &'static str {
    match msg_type {
        CLIENT_GET_AVATARS => "CLIENT_GET_AVATARS",
        CLIENT_GO_GET_LOST => "CLIENT_GO_GET_LOST",
        CLIENT_GET_AVATARS_RESP => "CLIENT_GET_AVATARS_RESP",
        CLIENT_CREATE_AVATAR => "CLIENT_CREATE_AVATAR",
        CLIENT_CREATE_AVATAR_RESP => "CLIENT_CREATE_AVATAR_RESP",
        CLIENT_GET_FRIEND_LIST => "CLIENT_GET_FRIEND_LIST",
        CLIENT_GET_FRIEND_LIST_RESP => "CLIENT_GET_FRIEND_LIST_RESP",
        CLIENT_GET_AVATAR_DETAILS_RESP => "CLIENT_GET_AVATAR_DETAILS_RESP",
        CLIENT_LOGIN_2 => "CLIENT_LOGIN_2",
        CLIENT_LOGIN_2_RESP => "CLIENT_LOGIN_2_RESP",
        CLIENT_OBJECT_UPDATE_FIELD => "CLIENT_OBJECT_UPDATE_FIELD",
        CLIENT_OBJECT_DISABLE => "CLIENT_OBJECT_DISABLE",
        CLIENT_SET_AVATAR => "CLIENT_SET_AVATAR",
        CLIENT_CREATE_OBJECT_REQUIRED => "CLIENT_CREATE_OBJECT_REQUIRED",
        CLIENT_CREATE_OBJECT_REQUIRED_OTHER => "CLIENT_CREATE_OBJECT_REQUIRED_OTHER",
        CLIENT_DISCONNECT => "CLIENT_DISCONNECT",
        CLIENT_DONE_INTEREST_RESP => "CLIENT_DONE_INTEREST_RESP",
        CLIENT_HEARTBEAT => "CLIENT_HEARTBEAT",
        CLIENT_FRIEND_ONLINE => "CLIENT_FRIEND_ONLINE",
        CLIENT_FRIEND_OFFLINE => "CLIENT_FRIEND_OFFLINE",
        CLIENT_DELETE_AVATAR => "CLIENT_DELETE_AVATAR",
        CLIENT_SET_NAME_PATTERN => "CLIENT_SET_NAME_PATTERN",
        CLIENT_SET_NAME_PATTERN_ANSWER => "CLIENT_SET_NAME_PATTERN_ANSWER",
        CLIENT_SET_WISHNAME => "CLIENT_SET_WISHNAME",
        CLIENT_SET_WISHNAME_RESP => "CLIENT_SET_WISHNAME_RESP",
        CLIENT_SYSTEM_MESSAGE => "CLIENT_SYSTEM_MESSAGE",
        CLIENT_ADD_INTEREST => "CLIENT_ADD_INTEREST",
        CLIENT_REMOVE_INTEREST => "CLIENT_REMOVE_INTEREST",
        CLIENT_OBJECT_LOCATION => "CLIENT_OBJECT_LOCATION",
        DBSERVER_CREATE_STORED_OBJECT => "DBSERVER_CREATE_STORED_OBJECT",
        DBSERVER_CREATE_STORED_OBJECT_RESP => "DBSERVER_CREATE_STORED_OBJECT_RESP",
        DBSERVER_DELETE_STORED_OBJECT => "DBSERVER_DELETE_STORED_OBJECT",
        DBSERVER_GET_STORED_VALUES => "DBSERVER_GET_STORED_VALUES",
        DBSERVER_GET_STORED_VALUES_RESP => "DBSERVER_GET_STORED_VALUES_RESP",
        DBSERVER_SET_STORED_VALUES => "DBSERVER_SET_STORED_VALUES",
        DBSERVER_ACCOUNT_QUERY => "DBSERVER_ACCOUNT_QUERY",
        DBSERVER_ACCOUNT_QUERY_RESP => "DBSERVER_ACCOUNT_QUERY_RESP",
        DBSERVER_ACCOUNT_SET_AVATAR => "DBSERVER_ACCOUNT_SET_AVATAR",
        DBSERVER_GET_FRIEND_LIST => "DBSERVER_GET_FRIEND_LIST",
        DBSERVER_GET_FRIEND_LIST_RESP => "DBSERVER_GET_FRIEND_LIST_RESP",
        STATESERVER_OBJECT_GENERATE_WITH_REQUIRED => "STATESERVER_OBJECT_GENERATE_WITH_REQUIRED",
        STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER => {
            "STATESERVER_OBJECT_GENERATE_WITH_REQUIRED_OTHER"
        }
        STATESERVER_OBJECT_UPDATE_FIELD => "STATESERVER_OBJECT_UPDATE_FIELD",
        STATESERVER_OBJECT_UPDATE_FIELD_MULTIPLE => "STATESERVER_OBJECT_UPDATE_FIELD_MULTIPLE",
        STATESERVER_OBJECT_DELETE_RAM => "STATESERVER_OBJECT_DELETE_RAM",
        STATESERVER_OBJECT_SET_ZONE => "STATESERVER_OBJECT_SET_ZONE",
        STATESERVER_OBJECT_CHANGE_ZONE => "STATESERVER_OBJECT_CHANGE_ZONE",
        STATESERVER_QUERY_OBJECT_ALL => "STATESERVER_QUERY_OBJECT_ALL",
        STATESERVER_QUERY_ZONE_OBJECT_ALL => "STATESERVER_QUERY_ZONE_OBJECT_ALL",
        STATESERVER_QUERY_OBJECT_ALL_RESP => "STATESERVER_QUERY_OBJECT_ALL_RESP",
        STATESERVER_ADD_AI_RECV => "STATESERVER_ADD_AI_RECV",
        STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE => "STATESERVER_QUERY_ZONE_OBJECT_ALL_DONE",
        STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT => {
            "STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT"
        }
        STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT => {
            "STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT"
        }
        STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP => {
            "STATESERVER_OBJECT_CREATE_WITH_REQUIRED_CONTEXT_RESP"
        }
        STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT_RESP => {
            "STATESERVER_OBJECT_CREATE_WITH_REQUIR_OTHER_CONTEXT_RESP"
        }
        STATESERVER_SHARD_RESET => "STATESERVER_SHARD_RESET",
        STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER => {
            "STATESERVER_OBJECT_ENTERZONE_WITH_REQUIRED_OTHER"
        }
        STATESERVER_OBJECT_ENTER_AI_RECV => "STATESERVER_OBJECT_ENTER_AI_RECV",
        STATESERVER_OBJECT_ENTER_OWNER_RECV => "STATESERVER_OBJECT_ENTER_OWNER_RECV",
        STATESERVER_OBJECT_SET_OWNER_RECV => "STATESERVER_OBJECT_SET_OWNER_RECV",
        CLIENT_AGENT_EJECT => "CLIENT_AGENT_EJECT",
        CLIENT_AGENT_SET_INTEREST => "CLIENT_AGENT_SET_INTEREST",
        CLIENT_AGENT_REMOVE_INTEREST => "CLIENT_AGENT_REMOVE_INTEREST",
        _ => "UNKNOWN",
    }
}
