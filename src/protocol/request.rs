use rmpv::Value;

use super::{CommandCode, IteratorKind, Key};

/// Options for `select`. The default fetches every match through an `Eq` iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOptions {
    pub iterator: IteratorKind,
    pub limit: u32,
    pub offset: u32,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            iterator: IteratorKind::Eq,
            limit: u32::MAX,
            offset: 0,
        }
    }
}

impl SelectOptions {
    pub fn iterator(mut self, iterator: IteratorKind) -> Self {
        self.iterator = iterator;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }
}

/// A single update operation. Field numbers and splice offsets are zero-based.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOperation {
    Add { field: u32, value: Value },
    Subtract { field: u32, value: Value },
    BitAnd { field: u32, value: u64 },
    BitOr { field: u32, value: u64 },
    BitXor { field: u32, value: u64 },
    /// Replace `length` characters at `offset` of a string field with `replacement`.
    Splice {
        field: u32,
        offset: i64,
        length: u32,
        replacement: String,
    },
    Insert { field: u32, value: Value },
    Delete { field: u32, count: u32 },
    Assign { field: u32, value: Value },
}

impl UpdateOperation {
    pub fn symbol(&self) -> &'static str {
        match self {
            UpdateOperation::Add { .. } => "+",
            UpdateOperation::Subtract { .. } => "-",
            UpdateOperation::BitAnd { .. } => "&",
            UpdateOperation::BitOr { .. } => "|",
            UpdateOperation::BitXor { .. } => "^",
            UpdateOperation::Splice { .. } => ":",
            UpdateOperation::Insert { .. } => "!",
            UpdateOperation::Delete { .. } => "#",
            UpdateOperation::Assign { .. } => "=",
        }
    }

    pub fn field(&self) -> u32 {
        match self {
            UpdateOperation::Add { field, .. }
            | UpdateOperation::Subtract { field, .. }
            | UpdateOperation::BitAnd { field, .. }
            | UpdateOperation::BitOr { field, .. }
            | UpdateOperation::BitXor { field, .. }
            | UpdateOperation::Splice { field, .. }
            | UpdateOperation::Insert { field, .. }
            | UpdateOperation::Delete { field, .. }
            | UpdateOperation::Assign { field, .. } => *field,
        }
    }
}

impl From<&UpdateOperation> for Value {
    fn from(op: &UpdateOperation) -> Self {
        let mut out = vec![Value::from(op.symbol()), Value::from(op.field())];
        match op {
            UpdateOperation::Add { value, .. }
            | UpdateOperation::Subtract { value, .. }
            | UpdateOperation::Insert { value, .. }
            | UpdateOperation::Assign { value, .. } => out.push(value.clone()),
            UpdateOperation::BitAnd { value, .. }
            | UpdateOperation::BitOr { value, .. }
            | UpdateOperation::BitXor { value, .. } => out.push(Value::from(*value)),
            UpdateOperation::Splice {
                offset,
                length,
                replacement,
                ..
            } => {
                out.push(Value::from(*offset));
                out.push(Value::from(*length));
                out.push(Value::from(replacement.as_str()));
            }
            UpdateOperation::Delete { count, .. } => out.push(Value::from(*count)),
        }
        Value::Array(out)
    }
}

/// The server's command vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Select {
        space_id: u32,
        index_id: u32,
        key: Value,
        options: SelectOptions,
    },
    Insert {
        space_id: u32,
        tuple: Value,
    },
    Replace {
        space_id: u32,
        tuple: Value,
    },
    Update {
        space_id: u32,
        index_id: u32,
        key: Value,
        ops: Vec<UpdateOperation>,
    },
    Upsert {
        space_id: u32,
        tuple: Value,
        ops: Vec<UpdateOperation>,
    },
    Delete {
        space_id: u32,
        index_id: u32,
        key: Value,
    },
    Call {
        function: String,
        args: Value,
    },
    OldCall {
        function: String,
        args: Value,
    },
    Eval {
        expression: String,
        args: Value,
    },
    Execute {
        sql: String,
        params: Value,
    },
    Auth {
        username: String,
        scramble: Vec<u8>,
    },
    Ping,
}

impl Request {
    pub fn code(&self) -> CommandCode {
        match self {
            Request::Select { .. } => CommandCode::Select,
            Request::Insert { .. } => CommandCode::Insert,
            Request::Replace { .. } => CommandCode::Replace,
            Request::Update { .. } => CommandCode::Update,
            Request::Upsert { .. } => CommandCode::Upsert,
            Request::Delete { .. } => CommandCode::Delete,
            Request::Call { .. } => CommandCode::Call,
            Request::OldCall { .. } => CommandCode::OldCall,
            Request::Eval { .. } => CommandCode::Eval,
            Request::Execute { .. } => CommandCode::Execute,
            Request::Auth { .. } => CommandCode::Auth,
            Request::Ping => CommandCode::Ping,
        }
    }

    /// The payload map carried after the header.
    pub fn body(&self) -> Value {
        let entries = match self {
            Request::Select {
                space_id,
                index_id,
                key,
                options,
            } => vec![
                (Key::SpaceId.into(), Value::from(*space_id)),
                (Key::IndexId.into(), Value::from(*index_id)),
                (Key::Limit.into(), Value::from(options.limit)),
                (Key::Offset.into(), Value::from(options.offset)),
                (Key::Iterator.into(), Value::from(options.iterator as u32)),
                (Key::Key.into(), key.clone()),
            ],
            Request::Insert { space_id, tuple } | Request::Replace { space_id, tuple } => vec![
                (Key::SpaceId.into(), Value::from(*space_id)),
                (Key::Tuple.into(), tuple.clone()),
            ],
            Request::Update {
                space_id,
                index_id,
                key,
                ops,
            } => vec![
                (Key::SpaceId.into(), Value::from(*space_id)),
                (Key::IndexId.into(), Value::from(*index_id)),
                (Key::Key.into(), key.clone()),
                (Key::Tuple.into(), ops_value(ops)),
            ],
            Request::Upsert {
                space_id,
                tuple,
                ops,
            } => vec![
                (Key::SpaceId.into(), Value::from(*space_id)),
                (Key::Tuple.into(), tuple.clone()),
                (Key::Ops.into(), ops_value(ops)),
            ],
            Request::Delete {
                space_id,
                index_id,
                key,
            } => vec![
                (Key::SpaceId.into(), Value::from(*space_id)),
                (Key::IndexId.into(), Value::from(*index_id)),
                (Key::Key.into(), key.clone()),
            ],
            Request::Call { function, args } | Request::OldCall { function, args } => vec![
                (Key::FunctionName.into(), Value::from(function.as_str())),
                (Key::Tuple.into(), args.clone()),
            ],
            Request::Eval { expression, args } => vec![
                (Key::Expression.into(), Value::from(expression.as_str())),
                (Key::Tuple.into(), args.clone()),
            ],
            Request::Execute { sql, params } => vec![
                (Key::SqlText.into(), Value::from(sql.as_str())),
                (Key::SqlBind.into(), params.clone()),
            ],
            Request::Auth { username, scramble } => vec![
                (Key::Username.into(), Value::from(username.as_str())),
                (
                    Key::Tuple.into(),
                    Value::Array(vec![
                        Value::from("chap-sha1"),
                        Value::Binary(scramble.clone()),
                    ]),
                ),
            ],
            Request::Ping => vec![],
        };
        Value::Map(entries)
    }
}

fn ops_value(ops: &[UpdateOperation]) -> Value {
    Value::Array(ops.iter().map(Value::from).collect())
}
