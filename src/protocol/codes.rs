/// Set on a response code when the server reports a failure.
pub const ERROR_BIT: u32 = 0x8000;

/// Request and response command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandCode {
    Ok = 0x00,
    Select = 0x01,
    Insert = 0x02,
    Replace = 0x03,
    Update = 0x04,
    Delete = 0x05,
    /// Pre-1.7 call semantics: every returned value is wrapped into a tuple.
    OldCall = 0x06,
    Auth = 0x07,
    Eval = 0x08,
    Upsert = 0x09,
    Call = 0x0a,
    Execute = 0x0b,
    Ping = 0x40,
}

impl From<CommandCode> for u32 {
    fn from(value: CommandCode) -> Self {
        value as u32
    }
}

impl TryFrom<u32> for CommandCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => CommandCode::Ok,
            0x01 => CommandCode::Select,
            0x02 => CommandCode::Insert,
            0x03 => CommandCode::Replace,
            0x04 => CommandCode::Update,
            0x05 => CommandCode::Delete,
            0x06 => CommandCode::OldCall,
            0x07 => CommandCode::Auth,
            0x08 => CommandCode::Eval,
            0x09 => CommandCode::Upsert,
            0x0a => CommandCode::Call,
            0x0b => CommandCode::Execute,
            0x40 => CommandCode::Ping,
            other => return Err(other),
        })
    }
}

/// Integer tags used as map keys in headers and payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Key {
    Code = 0x00,
    Sync = 0x01,
    SchemaId = 0x05,

    SpaceId = 0x10,
    IndexId = 0x11,
    Limit = 0x12,
    Offset = 0x13,
    Iterator = 0x14,

    Key = 0x20,
    Tuple = 0x21,
    FunctionName = 0x22,
    Username = 0x23,
    Expression = 0x27,
    Ops = 0x28,

    Data = 0x30,
    Error = 0x31,
    Metadata = 0x32,

    SqlText = 0x40,
    SqlBind = 0x41,
    SqlInfo = 0x42,
    /// Older servers put SQL info under this tag.
    SqlInfoLegacy = 0x43,
}

impl From<Key> for rmpv::Value {
    fn from(value: Key) -> Self {
        rmpv::Value::from(value as u8)
    }
}

/// Index iteration strategies understood by `select`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IteratorKind {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
    BitsAllSet = 7,
    BitsAnySet = 8,
    BitsAllNotSet = 9,
    Overlaps = 10,
    Neighbor = 11,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_code_round_trip() {
        let codes = [
            CommandCode::Select,
            CommandCode::Insert,
            CommandCode::Replace,
            CommandCode::Update,
            CommandCode::Delete,
            CommandCode::Auth,
            CommandCode::Eval,
            CommandCode::Upsert,
            CommandCode::Call,
            CommandCode::Execute,
            CommandCode::Ping,
        ];

        for code in codes {
            assert_eq!(CommandCode::try_from(u32::from(code)), Ok(code));
        }
    }

    #[test]
    fn unknown_command_code() {
        assert_eq!(CommandCode::try_from(0x7f), Err(0x7f));
    }
}
