//! In-process stand-in for a database server, speaking just enough of the binary
//! protocol for the client's integration tests.
#![allow(dead_code)]

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use iproto::{
    ClientConfig,
    protocol::{
        CommandCode, ERROR_BIT, GREETING_SIZE, Key, LENGTH_PREFIX_SIZE, ResponseHeader,
        decode_length_prefix, decode_request_header, encode_response, scramble,
    },
};
use log::{debug, warn};
use rmpv::Value;

const SALT: [u8; 32] = [
    7, 1, 9, 4, 2, 8, 3, 6, 5, 0, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67,
    71, 73, 79, 83, 89, 97, 101,
];
const ER_TUPLE_FOUND: u32 = 3;
const ER_NO_SUCH_PROC: u32 = 33;
const ER_CREDS: u32 = 47;

struct MockSpace {
    name: String,
    tuples: Vec<Vec<Value>>,
}

#[derive(Default)]
struct ServerState {
    spaces: Mutex<BTreeMap<u32, MockSpace>>,
    connections: AtomicUsize,
    ignore_pings: AtomicBool,
    credentials: Option<(String, String)>,
    live: Mutex<Vec<TcpStream>>,
}

pub struct MockServer {
    address: SocketAddr,
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::spawn(ServerState::default())
    }

    /// A server that rejects requests until `user` authenticates with `password`.
    pub fn with_user(user: &str, password: &str) -> Self {
        Self::spawn(ServerState {
            credentials: Some((user.to_string(), password.to_string())),
            ..ServerState::default()
        })
    }

    fn spawn(state: ServerState) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind mock server");
        let address = listener.local_addr().expect("no local address");
        let state = Arc::new(state);

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        accept_state.connections.fetch_add(1, Ordering::SeqCst);
                        if let Ok(clone) = stream.try_clone() {
                            accept_state.live.lock().unwrap().push(clone);
                        }
                        let state = Arc::clone(&accept_state);
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, state) {
                                debug!("mock connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("broken connection: {e:?}"),
                }
            }
        });

        Self { address, state }
    }

    pub fn uri(&self) -> String {
        self.address.to_string()
    }

    pub fn config(&self) -> ClientConfig {
        self.uri().parse().expect("mock uri is valid")
    }

    /// Accepted connections so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn set_ignore_pings(&self, ignore: bool) {
        self.state.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Shuts every accepted socket down, as a server restart would.
    pub fn drop_connections(&self) {
        for stream in self.state.live.lock().unwrap().drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn create_space(&self, id: u32, name: &str) {
        self.state.spaces.lock().unwrap().insert(
            id,
            MockSpace {
                name: name.to_string(),
                tuples: Vec::new(),
            },
        );
    }

    pub fn tuples(&self, id: u32) -> Vec<Vec<Value>> {
        self.state
            .spaces
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.tuples.clone())
            .unwrap_or_default()
    }
}

pub fn greeting() -> Vec<u8> {
    let mut out = vec![b' '; GREETING_SIZE];
    let banner = b"Tarantool 2.11.0 (Binary) 3c8e2a8b-8c0b-4a1f-9f4e-5d2f7b1c0a11";
    out[..banner.len()].copy_from_slice(banner);
    out[63] = b'\n';
    let salt = STANDARD.encode(SALT);
    out[64..64 + salt.len()].copy_from_slice(salt.as_bytes());
    out[127] = b'\n';
    out
}

type Shared<T> = Arc<Mutex<T>>;

fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    stream.write_all(&greeting())?;
    let writer: Shared<TcpStream> = Arc::new(Mutex::new(stream.try_clone()?));
    let mut authenticated = state.credentials.is_none();

    loop {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut prefix)?;
        let size = decode_length_prefix(&prefix)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut frame = vec![0u8; size];
        stream.read_exact(&mut frame)?;

        let mut cursor = frame.as_slice();
        let header = decode_request_header(&mut cursor)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let body = if cursor.is_empty() {
            HashMap::new()
        } else {
            match rmpv::decode::read_value(&mut cursor) {
                Ok(Value::Map(entries)) => entries
                    .into_iter()
                    .filter_map(|(k, v)| k.as_u64().map(|k| (k, v)))
                    .collect(),
                _ => HashMap::new(),
            }
        };
        let id = header.request_id;

        let reply = match CommandCode::try_from(header.code) {
            Ok(CommandCode::Auth) => {
                let result = check_auth(&state, &body);
                authenticated = result.is_ok();
                result
            }
            Ok(CommandCode::Ping) if state.ignore_pings.load(Ordering::SeqCst) => continue,
            Ok(CommandCode::Ping) => Ok(Vec::new()),
            Ok(_) if !authenticated => Err((ER_CREDS, "authentication required".to_string())),
            Ok(CommandCode::Call) if function_name(&body) == "sleep" => {
                // [millis, value]: answered from another thread after the delay.
                let args = array(&body, Key::Tuple);
                let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
                let value = args.get(1).cloned().unwrap_or(Value::Nil);
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(millis));
                    let _ = respond(&writer, id, Ok(data(vec![value])));
                });
                continue;
            }
            Ok(CommandCode::Execute) => {
                respond(&writer, id, Ok(sql_body(&body)))?;
                continue;
            }
            Ok(code) => execute(&state, code, &body),
            Err(code) => Err((0x30, format!("unknown request type {code}"))),
        };

        respond(&writer, id, reply.map(data))?;
    }
}

fn data(rows: Vec<Value>) -> Value {
    Value::Map(vec![(Key::Data.into(), Value::Array(rows))])
}

/// `SELECT ...` yields one integer column; anything else reports one changed row.
fn sql_body(body: &HashMap<u64, Value>) -> Value {
    let sql = body
        .get(&(Key::SqlText as u64))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if sql.trim_start().to_uppercase().starts_with("SELECT") {
        let bind = array(body, Key::SqlBind);
        let row = if bind.is_empty() { vec![Value::from(1)] } else { bind };
        Value::Map(vec![
            (
                Key::Metadata.into(),
                Value::Array(vec![Value::Map(vec![
                    (Value::from(0), Value::from("COLUMN_1")),
                    (Value::from(1), Value::from("integer")),
                ])]),
            ),
            (Key::Data.into(), Value::Array(vec![Value::Array(row)])),
        ])
    } else {
        Value::Map(vec![(
            Key::SqlInfo.into(),
            Value::Map(vec![
                (Value::from(0), Value::from(1)),
                (Value::from(1), Value::Array(vec![Value::from(42)])),
            ]),
        )])
    }
}

fn respond(
    writer: &Shared<TcpStream>,
    request_id: u64,
    reply: Result<Value, (u32, String)>,
) -> std::io::Result<()> {
    let (header, body) = match reply {
        Ok(body) => (ResponseHeader::ok(request_id), body),
        Err((code, message)) => (
            ResponseHeader {
                code: ERROR_BIT | code,
                request_id,
                schema_id: Some(1),
            },
            Value::Map(vec![(Key::Error.into(), Value::from(message))]),
        ),
    };
    let frame = encode_response(&header, &body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.lock().unwrap().write_all(&frame)
}

fn array(body: &HashMap<u64, Value>, key: Key) -> Vec<Value> {
    match body.get(&(key as u64)) {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn number(body: &HashMap<u64, Value>, key: Key) -> Option<u64> {
    body.get(&(key as u64)).and_then(Value::as_u64)
}

fn function_name(body: &HashMap<u64, Value>) -> String {
    body.get(&(Key::FunctionName as u64))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn check_auth(
    state: &ServerState,
    body: &HashMap<u64, Value>,
) -> Result<Vec<Value>, (u32, String)> {
    let user = body
        .get(&(Key::Username as u64))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let proof = array(body, Key::Tuple);
    let scrambled = proof.get(1).and_then(Value::as_slice).unwrap_or_default();

    match &state.credentials {
        Some((expected_user, password))
            if user == expected_user && scrambled == scramble(&SALT, password).as_slice() =>
        {
            Ok(Vec::new())
        }
        Some(_) => Err((ER_CREDS, format!("Incorrect password supplied for user '{user}'"))),
        None => Ok(Vec::new()),
    }
}

fn compare(a: &Value, b: &Value) -> CmpOrdering {
    match (a.as_u64(), b.as_u64()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn system_views(spaces: &BTreeMap<u32, MockSpace>, space_id: u32) -> Vec<Value> {
    spaces
        .iter()
        .map(|(id, space)| {
            if space_id == 281 {
                Value::Array(vec![
                    Value::from(*id),
                    Value::from(1),
                    Value::from(space.name.as_str()),
                    Value::from("memtx"),
                    Value::from(0),
                    Value::Map(vec![]),
                    Value::Array(vec![
                        Value::Map(vec![
                            (Value::from("name"), Value::from("id")),
                            (Value::from("type"), Value::from("unsigned")),
                        ]),
                        Value::Map(vec![
                            (Value::from("name"), Value::from("name")),
                            (Value::from("type"), Value::from("string")),
                        ]),
                    ]),
                ])
            } else {
                Value::Array(vec![
                    Value::from(*id),
                    Value::from(0),
                    Value::from("primary"),
                    Value::from("tree"),
                    Value::Map(vec![(Value::from("unique"), Value::from(true))]),
                    Value::Array(vec![Value::Array(vec![
                        Value::from(0),
                        Value::from("unsigned"),
                    ])]),
                ])
            }
        })
        .collect()
}

fn execute(
    state: &ServerState,
    code: CommandCode,
    body: &HashMap<u64, Value>,
) -> Result<Vec<Value>, (u32, String)> {
    let mut spaces = state.spaces.lock().unwrap();
    let space_id = number(body, Key::SpaceId).unwrap_or(0) as u32;

    match code {
        CommandCode::Select if space_id == 281 || space_id == 289 => {
            Ok(system_views(&spaces, space_id))
        }
        CommandCode::Call => match function_name(body).as_str() {
            "echo" => Ok(array(body, Key::Tuple)),
            name => Err((ER_NO_SUCH_PROC, format!("Procedure '{name}' is not defined"))),
        },
        CommandCode::OldCall => Ok(array(body, Key::Tuple)
            .into_iter()
            .map(|v| Value::Array(vec![v]))
            .collect()),
        CommandCode::Eval => Ok(array(body, Key::Tuple)),
        _ => {
            let space = spaces
                .get_mut(&space_id)
                .ok_or((36, format!("Space '{space_id}' does not exist")))?;
            apply(space, code, body)
        }
    }
}

fn position(space: &MockSpace, key: &[Value]) -> Option<usize> {
    let key = key.first()?;
    space
        .tuples
        .iter()
        .position(|t| t.first().is_some_and(|f| compare(f, key) == CmpOrdering::Equal))
}

fn apply(
    space: &mut MockSpace,
    code: CommandCode,
    body: &HashMap<u64, Value>,
) -> Result<Vec<Value>, (u32, String)> {
    match code {
        CommandCode::Select => {
            let key = array(body, Key::Key);
            let iterator = number(body, Key::Iterator).unwrap_or(0);
            let offset = number(body, Key::Offset).unwrap_or(0) as usize;
            let limit = number(body, Key::Limit).unwrap_or(u64::MAX) as usize;

            let mut rows: Vec<Vec<Value>> = space
                .tuples
                .iter()
                .filter(|t| match (key.first(), t.first()) {
                    (None, _) | (_, None) => true,
                    (Some(k), Some(f)) => match iterator {
                        // EQ, REQ
                        0 | 1 => compare(f, k) == CmpOrdering::Equal,
                        // ALL
                        2 => true,
                        3 => compare(f, k) == CmpOrdering::Less,
                        4 => compare(f, k) != CmpOrdering::Greater,
                        5 => compare(f, k) != CmpOrdering::Less,
                        6 => compare(f, k) == CmpOrdering::Greater,
                        _ => false,
                    },
                })
                .cloned()
                .collect();
            rows.sort_by(|a, b| compare(&a[0], &b[0]));
            if matches!(iterator, 1 | 3 | 4) {
                rows.reverse();
            }
            Ok(rows
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(Value::Array)
                .collect())
        }
        CommandCode::Insert => {
            let tuple = array(body, Key::Tuple);
            if position(space, &tuple).is_some() {
                let message = format!(
                    "Duplicate key exists in unique index 'primary' in space '{}'",
                    space.name
                );
                return Err((ER_TUPLE_FOUND, message));
            }
            space.tuples.push(tuple.clone());
            Ok(vec![Value::Array(tuple)])
        }
        CommandCode::Replace => {
            let tuple = array(body, Key::Tuple);
            match position(space, &tuple) {
                Some(i) => space.tuples[i] = tuple.clone(),
                None => space.tuples.push(tuple.clone()),
            }
            Ok(vec![Value::Array(tuple)])
        }
        CommandCode::Update => {
            let key = array(body, Key::Key);
            let ops = array(body, Key::Tuple);
            match position(space, &key) {
                Some(i) => {
                    apply_ops(&mut space.tuples[i], &ops)?;
                    Ok(vec![Value::Array(space.tuples[i].clone())])
                }
                None => Ok(Vec::new()),
            }
        }
        CommandCode::Upsert => {
            let tuple = array(body, Key::Tuple);
            let ops = array(body, Key::Ops);
            match position(space, &tuple) {
                Some(i) => apply_ops(&mut space.tuples[i], &ops)?,
                None => space.tuples.push(tuple),
            }
            Ok(Vec::new())
        }
        CommandCode::Delete => {
            let key = array(body, Key::Key);
            match position(space, &key) {
                Some(i) => Ok(vec![Value::Array(space.tuples.remove(i))]),
                None => Ok(Vec::new()),
            }
        }
        other => Err((0x30, format!("unsupported request {other:?}"))),
    }
}

fn apply_ops(tuple: &mut Vec<Value>, ops: &[Value]) -> Result<(), (u32, String)> {
    for op in ops {
        let op = op.as_array().cloned().unwrap_or_default();
        let symbol = op.first().and_then(Value::as_str).unwrap_or_default();
        let field = op.get(1).and_then(Value::as_u64).unwrap_or(0) as usize;
        let bad_field = || (9, format!("Field {field} was not found in the tuple"));

        match symbol {
            "=" if field < tuple.len() => tuple[field] = op[2].clone(),
            "=" if field == tuple.len() => tuple.push(op[2].clone()),
            "+" | "-" => {
                let current = tuple.get(field).and_then(Value::as_i64).ok_or_else(bad_field)?;
                let delta = op[2].as_i64().unwrap_or(0);
                let next = if symbol == "+" { current + delta } else { current - delta };
                tuple[field] = Value::from(next);
            }
            "!" if field <= tuple.len() => tuple.insert(field, op[2].clone()),
            "#" if field < tuple.len() => {
                let count = op[2].as_u64().unwrap_or(1) as usize;
                tuple.drain(field..(field + count).min(tuple.len()));
            }
            ":" => {
                let current = tuple.get(field).and_then(Value::as_str).ok_or_else(bad_field)?;
                let chars: Vec<char> = current.chars().collect();
                let offset = (op[2].as_u64().unwrap_or(0) as usize).min(chars.len());
                let length = op[3].as_u64().unwrap_or(0) as usize;
                let end = (offset + length).min(chars.len());
                let mut spliced: String = chars[..offset].iter().collect();
                spliced.push_str(op[4].as_str().unwrap_or_default());
                spliced.extend(&chars[end..]);
                tuple[field] = Value::from(spliced);
            }
            _ => return Err(bad_field()),
        }
    }
    Ok(())
}
