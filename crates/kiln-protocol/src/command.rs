use crate::{CommandLetter, ProtocolError};
use serde_json::Value;
use std::collections::BTreeMap;

/// `CmdResponse` extra key a Listener uses to report its bound port.
pub const PORT_KEY: &str = "port";

/// Post-processing role assigned by the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Listener,
    Provider,
}

impl Role {
    pub fn code(self) -> &'static str {
        match self {
            Self::Listener => "L",
            Self::Provider => "P",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "L" => Some(Self::Listener),
            "P" => Some(Self::Provider),
            _ => None,
        }
    }
}

/// Master to worker control messages, carried in `Command` letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Assigns a post-processing role. Providers get the listener's `host:port`.
    Config {
        role: Role,
        listener: Option<String>,
    },
    Accept,
    AcceptReset,
    ListenerAddrUpdate {
        address: String,
    },
    ListenerLost,
    ReworkTask {
        tids: Vec<String>,
    },
    Clean {
        tid: String,
    },
}

impl Command {
    pub const CONFIG: &'static str = "config";
    pub const ACCEPT: &'static str = "accept";
    pub const ACCEPT_RESET: &'static str = "accept_rst";
    pub const LISTENER_ADDR_UPDATE: &'static str = "lis_addr_update";
    pub const LISTENER_LOST: &'static str = "lis_lost";
    pub const REWORK: &'static str = "rework";
    pub const CLEAN: &'static str = "clean";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => Self::CONFIG,
            Self::Accept => Self::ACCEPT,
            Self::AcceptReset => Self::ACCEPT_RESET,
            Self::ListenerAddrUpdate { .. } => Self::LISTENER_ADDR_UPDATE,
            Self::ListenerLost => Self::LISTENER_LOST,
            Self::ReworkTask { .. } => Self::REWORK,
            Self::Clean { .. } => Self::CLEAN,
        }
    }

    pub fn to_letter(&self) -> CommandLetter {
        let mut letter = CommandLetter::default();
        letter.header.kind = self.kind().to_string();

        let content = &mut letter.content;
        match self {
            Self::Config { role, listener } => {
                content.insert("role".into(), Value::from(role.code()));
                content.insert(
                    "address".into(),
                    Value::from(listener.clone().unwrap_or_default()),
                );
            }
            Self::ListenerAddrUpdate { address } => {
                content.insert("address".into(), Value::from(address.as_str()));
            }
            Self::ReworkTask { tids } => {
                content.insert("tids".into(), Value::from(tids.clone()));
            }
            Self::Clean { tid } => {
                letter.header.target = tid.clone();
            }
            Self::Accept | Self::AcceptReset | Self::ListenerLost => {}
        }
        letter
    }

    pub fn from_letter(letter: &CommandLetter) -> Result<Self, ProtocolError> {
        let content = &letter.content;
        let command = match letter.header.kind.as_str() {
            Self::CONFIG => {
                let code = text(content, "role")?;
                let role = Role::from_code(code)
                    .ok_or_else(|| ProtocolError::Malformed(format!("unknown role {code}")))?;
                let listener = text(content, "address").ok().filter(|a| !a.is_empty());
                if role == Role::Provider && listener.is_none() {
                    return Err(ProtocolError::Malformed(
                        "provider config without listener address".to_string(),
                    ));
                }
                Self::Config {
                    role,
                    listener: listener.map(str::to_string),
                }
            }
            Self::ACCEPT => Self::Accept,
            Self::ACCEPT_RESET => Self::AcceptReset,
            Self::LISTENER_ADDR_UPDATE => Self::ListenerAddrUpdate {
                address: text(content, "address")?.to_string(),
            },
            Self::LISTENER_LOST => Self::ListenerLost,
            Self::REWORK => {
                let tids = content
                    .get("tids")
                    .and_then(Value::as_array)
                    .ok_or_else(|| ProtocolError::Malformed("rework without tids".to_string()))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Self::ReworkTask { tids }
            }
            Self::CLEAN if !letter.header.target.is_empty() => Self::Clean {
                tid: letter.header.target.clone(),
            },
            Self::CLEAN => {
                return Err(ProtocolError::Malformed("clean without target".to_string()));
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

fn text<'a>(content: &'a BTreeMap<String, Value>, key: &str) -> Result<&'a str, ProtocolError> {
    content
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed(format!("command missing {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Letter;

    #[test]
    fn commands_survive_the_wire() {
        let commands = vec![
            Command::Config {
                role: Role::Listener,
                listener: None,
            },
            Command::Config {
                role: Role::Provider,
                listener: Some("10.0.0.2:8066".to_string()),
            },
            Command::Accept,
            Command::AcceptReset,
            Command::ListenerAddrUpdate {
                address: "10.0.0.3:8066".to_string(),
            },
            Command::ListenerLost,
            Command::ReworkTask {
                tids: vec!["a".to_string(), "b".to_string()],
            },
            Command::Clean {
                tid: "a".to_string(),
            },
        ];

        for command in commands {
            let letter = Letter::from(command.to_letter());
            let bytes = letter.to_bytes_with_length().expect("encode command");
            let Letter::Command(parsed) = Letter::parse(&bytes).expect("parse command") else {
                panic!("expected command letter");
            };
            assert_eq!(
                Command::from_letter(&parsed).expect("typed command"),
                command
            );
        }
    }

    #[test]
    fn provider_config_requires_address() {
        let mut letter = Command::Config {
            role: Role::Provider,
            listener: None,
        }
        .to_letter();
        letter.header.kind = Command::CONFIG.to_string();

        let error = Command::from_letter(&letter).expect_err("provider needs listener");
        assert!(matches!(error, ProtocolError::Malformed(_)));
    }

    #[test]
    fn unknown_command_type_is_reported() {
        let mut letter = CommandLetter::default();
        letter.header.kind = "reboot".to_string();

        let error = Command::from_letter(&letter).expect_err("unknown command");
        assert!(matches!(error, ProtocolError::UnknownCommand(kind) if kind == "reboot"));
    }
}
