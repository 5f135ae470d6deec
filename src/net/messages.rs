//! Wire constants shared with the client. These values are a protocol
//! contract and must not change between releases.

// Authentication messages (0x0001 - 0x00FF)
pub const MSG_AUTH_CHALLENGE: u16 = 0x0001;
pub const MSG_AUTH_RESPONSE: u16 = 0x0002;
pub const MSG_AUTH_RESULT: u16 = 0x0003;
pub const MSG_CHAR_LIST_REQUEST: u16 = 0x0004;
pub const MSG_CHAR_LIST_RESPONSE: u16 = 0x0005;
pub const MSG_CHAR_CREATE_REQUEST: u16 = 0x0006;
pub const MSG_CHAR_CREATE_RESPONSE: u16 = 0x0007;
pub const MSG_CHAR_DELETE_REQUEST: u16 = 0x0008;
pub const MSG_CHAR_DELETE_RESPONSE: u16 = 0x0009;
pub const MSG_WORLD_LIST_REQUEST: u16 = 0x000a;
pub const MSG_WORLD_LIST_RESPONSE: u16 = 0x000b;
pub const MSG_CHAR_SELECT_REQUEST: u16 = 0x000c;
pub const MSG_CHAR_SELECT_RESPONSE: u16 = 0x000d;

// Game server messages (0x1000 - 0x1FFF)
pub const MSG_GAME_HANDSHAKE: u16 = 0x1001;
pub const MSG_GAME_SESSION: u16 = 0x1002;
pub const MSG_PLAYER_MOVEMENT: u16 = 0x1003;
pub const MSG_PLAYER_STATE: u16 = 0x1004;
pub const MSG_WORLD_STATE: u16 = 0x1005;
pub const MSG_OBJECT_CREATE: u16 = 0x1006;
pub const MSG_OBJECT_UPDATE: u16 = 0x1007;
pub const MSG_OBJECT_DESTROY: u16 = 0x1008;
pub const MSG_CHAT_MESSAGE: u16 = 0x1009;
pub const MSG_PLAYER_COMMAND: u16 = 0x100a;
pub const MSG_REGION_LOAD: u16 = 0x100b;
pub const MSG_JACKOUT_REQUEST: u16 = 0x100c;
pub const MSG_JACKOUT_RESPONSE: u16 = 0x100d;

// Player state flags
pub const PLAYER_STATE_COMBAT: u32 = 0x0001;
pub const PLAYER_STATE_SITTING: u32 = 0x0002;
pub const PLAYER_STATE_DEAD: u32 = 0x0004;
pub const PLAYER_STATE_INVISIBLE: u32 = 0x0008;
pub const PLAYER_STATE_PVP_ENABLED: u32 = 0x0010;
pub const PLAYER_STATE_RUNNING: u32 = 0x0020;
pub const PLAYER_STATE_STEALTHED: u32 = 0x0040;
pub const PLAYER_STATE_AFK: u32 = 0x0080;

// Margin server messages (0x2000 - 0x2FFF)
pub const MSG_MISSION_LIST_REQUEST: u16 = 0x2001;
pub const MSG_MISSION_LIST_RESPONSE: u16 = 0x2002;
pub const MSG_MISSION_ACCEPT: u16 = 0x2003;
pub const MSG_MISSION_UPDATE: u16 = 0x2004;
pub const MSG_MISSION_COMPLETE: u16 = 0x2005;
pub const MSG_DIALOGUE_REQUEST: u16 = 0x2006;
pub const MSG_DIALOGUE_RESPONSE: u16 = 0x2007;
pub const MSG_DIALOGUE_CHOICE: u16 = 0x2008;

// Byte commands (0x00 - 0xFF)
pub const CMD_READY_FOR_SPAWN: u8 = 0x01;
pub const CMD_CHAT: u8 = 0x02;
pub const CMD_WHISPER: u8 = 0x03;
pub const CMD_STOP_ANIMATION: u8 = 0x04;
pub const CMD_START_ANIMATION: u8 = 0x05;
pub const CMD_CHANGE_MOOD: u8 = 0x06;
pub const CMD_PERFORM_EMOTE: u8 = 0x07;
pub const CMD_DYNAMIC_OBJ_INTERACTION: u8 = 0x08;
pub const CMD_STATIC_OBJ_INTERACTION: u8 = 0x09;
pub const CMD_JUMP: u8 = 0x0a;
pub const CMD_REGION_LOADED: u8 = 0x0b;
pub const CMD_READY_FOR_WORLD_CHANGE: u8 = 0x0c;
pub const CMD_WHO: u8 = 0x0d;
pub const CMD_WHERE_AM_I: u8 = 0x0e;
pub const CMD_GET_PLAYER_DETAILS: u8 = 0x0f;
pub const CMD_GET_BACKGROUND: u8 = 0x10;
pub const CMD_SET_BACKGROUND: u8 = 0x11;
pub const CMD_HARDLINE_TELEPORT: u8 = 0x12;
pub const CMD_OBJECT_SELECTED: u8 = 0x13;
pub const CMD_JACKOUT_REQUEST: u8 = 0x14;
pub const CMD_JACKOUT_FINISHED: u8 = 0x15;

// Short commands (0x0100 - 0xFFFF). A leading 0x00 byte in the command
// payload marks the short form.
pub const CMD_SHORT_MARKER: u8 = 0x00;
pub const CMD_ABILITY_USE: u16 = 0x0100;
pub const CMD_TRADE_REQUEST: u16 = 0x0101;
pub const CMD_TRADE_ACCEPT: u16 = 0x0102;
pub const CMD_TRADE_DECLINE: u16 = 0x0103;
pub const CMD_TRADE_CANCEL: u16 = 0x0104;
pub const CMD_TRADE_ADD_ITEM: u16 = 0x0105;
pub const CMD_TRADE_REMOVE_ITEM: u16 = 0x0106;
pub const CMD_TRADE_SET_INFO: u16 = 0x0107;
pub const CMD_TRADE_CONFIRM: u16 = 0x0108;
pub const CMD_GROUP_INVITE: u16 = 0x0109;
pub const CMD_GROUP_ACCEPT: u16 = 0x010a;
pub const CMD_GROUP_DECLINE: u16 = 0x010b;
pub const CMD_GROUP_LEAVE: u16 = 0x010c;
pub const CMD_GROUP_KICK: u16 = 0x010d;
pub const CMD_GROUP_PROMOTE: u16 = 0x010e;
pub const CMD_GROUP_DISBAND: u16 = 0x010f;

// Chat message types
pub const CHAT_SAY: u8 = 0x00;
pub const CHAT_YELL: u8 = 0x01;
pub const CHAT_WHISPER: u8 = 0x02;
pub const CHAT_GROUP: u8 = 0x03;
pub const CHAT_FACTION: u8 = 0x04;
pub const CHAT_SYSTEM: u8 = 0x05;
pub const CHAT_EMOTE: u8 = 0x06;
pub const CHAT_OOC: u8 = 0x07;
pub const CHAT_BROADCAST: u8 = 0x08;

// Authentication result codes
pub const AUTH_SUCCESS: u16 = 0x00;
pub const AUTH_INVALID_CREDENTIALS: u16 = 0x01;
pub const AUTH_ACCOUNT_BANNED: u16 = 0x02;
pub const AUTH_SERVER_FULL: u16 = 0x03;
pub const AUTH_ALREADY_LOGGED_IN: u16 = 0x04;
pub const AUTH_INVALID_CLIENT_VERSION: u16 = 0x05;
pub const AUTH_INTERNAL_ERROR: u16 = 0x06;
pub const AUTH_ACCOUNT_SUSPENDED: u16 = 0x07;
pub const AUTH_NO_ACCESS: u16 = 0x08;
pub const AUTH_MAINTENANCE: u16 = 0x09;

// Object types
pub const OBJECT_TYPE_NONE: u16 = 0x0000;
pub const OBJECT_TYPE_PLAYER: u16 = 0x0001;
pub const OBJECT_TYPE_NPC: u16 = 0x0002;
pub const OBJECT_TYPE_ITEM: u16 = 0x0003;
pub const OBJECT_TYPE_CONTAINER: u16 = 0x0004;
pub const OBJECT_TYPE_HARDLINE: u16 = 0x0005;
pub const OBJECT_TYPE_DOOR: u16 = 0x0006;
pub const OBJECT_TYPE_COMPUTER: u16 = 0x0007;
pub const OBJECT_TYPE_MISSION_GIVER: u16 = 0x0008;
pub const OBJECT_TYPE_VENDOR: u16 = 0x0009;
pub const OBJECT_TYPE_TRAINER: u16 = 0x000a;
pub const OBJECT_TYPE_INTERACTIVE: u16 = 0x000b;
pub const OBJECT_TYPE_ELEVATOR: u16 = 0x000c;
pub const OBJECT_TYPE_PORTAL: u16 = 0x000d;

// Animation ids
pub const ANIM_STAND: u8 = 0x00;
pub const ANIM_WALK: u8 = 0x01;
pub const ANIM_RUN: u8 = 0x02;
pub const ANIM_JUMP: u8 = 0x03;
pub const ANIM_COMBAT_IDLE: u8 = 0x04;
pub const ANIM_COMBAT_WALK: u8 = 0x05;
pub const ANIM_COMBAT_RUN: u8 = 0x06;
pub const ANIM_COMBAT_JUMP: u8 = 0x07;
pub const ANIM_SIT: u8 = 0x08;
pub const ANIM_KNEEL: u8 = 0x09;
pub const ANIM_DEATH: u8 = 0x0a;
pub const ANIM_WAVE: u8 = 0x0b;
pub const ANIM_BOW: u8 = 0x0c;
pub const ANIM_CLAP: u8 = 0x0d;
pub const ANIM_DANCE: u8 = 0x0e;
pub const ANIM_LAUGH: u8 = 0x0f;
pub const ANIM_POINT: u8 = 0x10;
pub const ANIM_SHRUG: u8 = 0x11;
pub const ANIM_TAUNT: u8 = 0x12;
pub const ANIM_MEDITATE: u8 = 0x13;

// Mood ids
pub const MOOD_NEUTRAL: u8 = 0x00;
pub const MOOD_HAPPY: u8 = 0x01;
pub const MOOD_SAD: u8 = 0x02;
pub const MOOD_ANGRY: u8 = 0x03;
pub const MOOD_SURPRISED: u8 = 0x04;
pub const MOOD_AFRAID: u8 = 0x05;
pub const MOOD_DISGUSTED: u8 = 0x06;
pub const MOOD_BORED: u8 = 0x07;
pub const MOOD_DETERMINED: u8 = 0x08;
pub const MOOD_CONFUSED: u8 = 0x09;
pub const MOOD_SUSPICIOUS: u8 = 0x0a;

// District ids
pub const DISTRICT_RICHLAND: u8 = 0x01;
pub const DISTRICT_DOWNTOWN: u8 = 0x02;
pub const DISTRICT_WESTVIEW: u8 = 0x03;
pub const DISTRICT_INTERNATIONAL: u8 = 0x04;
pub const DISTRICT_UENO: u8 = 0x05;
pub const DISTRICT_STAMOS: u8 = 0x06;
pub const DISTRICT_TABOR: u8 = 0x07;
pub const DISTRICT_EDGEWATER: u8 = 0x08;
pub const DISTRICT_GRACY: u8 = 0x09;
pub const DISTRICT_HISTORIC: u8 = 0x0a;
pub const DISTRICT_CENTER: u8 = 0x0b;
pub const DISTRICT_KEDEMOTH: u8 = 0x0c;

// Profession ids
pub const PROFESSION_NONE: u8 = 0x00;
pub const PROFESSION_CODER: u8 = 0x01;
pub const PROFESSION_HACKER: u8 = 0x02;
pub const PROFESSION_OPERATIVE: u8 = 0x03;
pub const PROFESSION_REDPILL: u8 = 0x04;

// Alignment ids
pub const ALIGNMENT_NEUTRAL: u8 = 0x00;
pub const ALIGNMENT_ZION: u8 = 0x01;
pub const ALIGNMENT_MACHINE: u8 = 0x02;
pub const ALIGNMENT_MEROVINGIAN: u8 = 0x03;

// Network packet flags
pub const PACKET_FLAG_RELIABLE: u8 = 0x01;
pub const PACKET_FLAG_ENCRYPTED: u8 = 0x02;
pub const PACKET_FLAG_COMPRESSED: u8 = 0x04;
pub const PACKET_FLAG_FRAGMENT: u8 = 0x08;
