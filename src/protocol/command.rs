use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;

/// Whether the caller waits for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendType {
    #[default]
    RoundTrip,
    FireAndForget,
}

/// Server role a command wants to run against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Any,
    Master,
    Slave,
    Sentinel,
    Unknown,
}

impl Role {
    /// Map a `ROLE` / `INFO` role name to a role
    pub fn from_name(name: &[u8]) -> Role {
        if name.eq_ignore_ascii_case(b"master") {
            Role::Master
        } else if name.eq_ignore_ascii_case(b"slave") || name.eq_ignore_ascii_case(b"replica") {
            Role::Slave
        } else if name.eq_ignore_ascii_case(b"sentinel") {
            Role::Sentinel
        } else {
            Role::Unknown
        }
    }

    /// Whether a connection with role `self` can serve a request for `wanted`.
    /// Connections whose role was never resolved serve anything.
    pub fn serves(self, wanted: Role) -> bool {
        match wanted {
            Role::Any => true,
            _ => self == wanted || self == Role::Unknown,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Role::Any => 0,
            Role::Master => 1,
            Role::Slave => 2,
            Role::Sentinel => 3,
            Role::Unknown => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Role {
        match value {
            0 => Role::Any,
            1 => Role::Master,
            2 => Role::Slave,
            3 => Role::Sentinel,
            _ => Role::Unknown,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Any => "any",
            Role::Master => "master",
            Role::Slave => "slave",
            Role::Sentinel => "sentinel",
            Role::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A single request to the server, built once and consumed by one execution
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    db: u32,
    name: Bytes,
    args: Vec<Option<Bytes>>,
    send_type: SendType,
    role: Role,
    throw_on_error: bool,
}

impl Command {
    pub fn new(db: u32, name: impl Into<Bytes>) -> Self {
        Self {
            db,
            name: name.into(),
            args: Vec::new(),
            send_type: SendType::RoundTrip,
            role: Role::Any,
            throw_on_error: true,
        }
    }

    /// Build a command from a whitespace-separated line, e.g. `"SET foo bar"`
    pub fn parse(db: u32, line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::MissingParameter("command name".to_string()))?;
        Ok(parts.fold(Command::new(db, name.to_string()), |cmd, arg| {
            cmd.arg(arg.to_string())
        }))
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(Some(arg.into()));
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        self.args.extend(args.into_iter().map(|a| Some(a.into())));
        self
    }

    /// Append an argument encoded as a RESP null bulk string
    pub fn null_arg(mut self) -> Self {
        self.args.push(None);
        self
    }

    pub fn int_arg(self, value: i64) -> Self {
        let mut buf = itoa::Buffer::new();
        let text = buf.format(value).to_owned();
        self.arg(text)
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.send_type = SendType::FireAndForget;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Projection failures return the shape's default instead of an error
    pub fn suppress_errors(mut self) -> Self {
        self.throw_on_error = false;
        self
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Arguments; `None` is sent as a null bulk string
    pub fn arguments(&self) -> &[Option<Bytes>] {
        &self.args
    }

    pub fn send_type(&self) -> SendType {
        self.send_type
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn throw_on_error(&self) -> bool {
        self.throw_on_error
    }

    /// Argument checks that must fail before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::MissingParameter("command name".to_string()));
        }
        if self.name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err(Error::MissingParameter(format!(
                "command name '{}' contains whitespace",
                String::from_utf8_lossy(&self.name)
            )));
        }
        Ok(())
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.name))?;
        for arg in &self.args {
            match arg {
                Some(arg) => write!(f, " {}", String::from_utf8_lossy(arg))?,
                None => write!(f, " (nil)")?,
            }
        }
        Ok(())
    }
}
