use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha1::{Digest, Sha1};

use crate::error::ClientError;

/// The server writes exactly this many bytes before anything else.
pub const GREETING_SIZE: usize = 128;

const LINE_SIZE: usize = 64;
const SALT_SIZE: usize = 44;
const SCRAMBLE_SIZE: usize = 20;

/// The banner and authentication salt sent by the server on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub banner: String,
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClientError> {
        if bytes.len() != GREETING_SIZE {
            return Err(ClientError::InvalidGreeting(format!(
                "expected {GREETING_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        let banner = std::str::from_utf8(&bytes[..LINE_SIZE])
            .map_err(|_| ClientError::InvalidGreeting("banner is not ascii".into()))?
            .trim_end()
            .to_string();

        let encoded = &bytes[LINE_SIZE..LINE_SIZE + SALT_SIZE];
        let salt = STANDARD
            .decode(encoded)
            .map_err(|e| ClientError::InvalidGreeting(format!("malformed salt: {e}")))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(ClientError::InvalidGreeting(format!(
                "salt too short: {} bytes",
                salt.len()
            )));
        }

        Ok(Self { banner, salt })
    }

    /// Server version, the second word of the banner.
    pub fn version(&self) -> Option<&str> {
        self.banner.split_whitespace().nth(1)
    }

    /// Protocol name in parentheses, e.g. `Binary`.
    pub fn protocol(&self) -> Option<&str> {
        let start = self.banner.find('(')? + 1;
        let end = start + self.banner[start..].find(')')?;
        Some(&self.banner[start..end])
    }
}

/// `SHA1(password) XOR SHA1(salt[..20] ++ SHA1(SHA1(password)))`
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE.min(salt.len())]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}
