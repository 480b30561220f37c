//! Chat input: plain lines are messages, `/` lines are commands.

use duo_core::{Key, LoraAddress, MacAddress, RadioType, Settings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Set(SettingEdit),
    History,
    Help,
    Quit,
}

/// A single settings edit, as typed. Addresses are parsed against the active radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingEdit {
    PrimaryKey(Key),
    LocalKey(Key),
    Peer(String),
    Me(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?} (try /help)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Unsupported(&'static str),
}

pub const HELP: &str = "\
/set key <16 chars>      primary key
/set lmk <16 chars>      local key (short-range only)
/set peer <mac|addr>     paired device address
/set me <addr>           own station address (long-range only)
/history                 recent messages
/quit";

const SET_USAGE: &str = "/set key|lmk|peer|me <value>";

/// `None` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let mut words = rest.split_whitespace();
    let cmd = match words.next().unwrap_or_default() {
        "set" => {
            let field = words.next().ok_or(CommandError::Usage(SET_USAGE))?;
            let value = words.next().ok_or(CommandError::Usage(SET_USAGE))?;
            let key = |v: &str| Key::try_from(v).map_err(|e| CommandError::Invalid(e.to_string()));
            let edit = match field {
                "key" => SettingEdit::PrimaryKey(key(value)?),
                "lmk" => SettingEdit::LocalKey(key(value)?),
                "peer" => SettingEdit::Peer(value.to_string()),
                "me" => SettingEdit::Me(value.to_string()),
                _ => return Err(CommandError::Usage(SET_USAGE)),
            };
            Command::Set(edit)
        }
        "history" => Command::History,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(cmd))
}

/// The settings after `edit`. The caller diffs old against new.
pub fn apply(settings: &Settings, edit: &SettingEdit) -> Result<Settings, CommandError> {
    let mut next = settings.clone();
    let invalid = |e: duo_core::address::AddressParseError| CommandError::Invalid(e.to_string());
    match edit {
        SettingEdit::PrimaryKey(key) => next.primary_key = *key,
        SettingEdit::LocalKey(key) => next.local_key = *key,
        SettingEdit::Peer(value) => match settings.radio {
            RadioType::EspNow => next.other_mac = value.parse::<MacAddress>().map_err(invalid)?,
            RadioType::Lora => {
                next.other_lora_address = value.parse::<LoraAddress>().map_err(invalid)?
            }
        },
        SettingEdit::Me(value) => match settings.radio {
            RadioType::EspNow => {
                return Err(CommandError::Unsupported(
                    "the short-range address is fixed by the hardware",
                ))
            }
            RadioType::Lora => {
                next.my_lora_address = value.parse::<LoraAddress>().map_err(invalid)?
            }
        },
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duo_core::ChangeFlags;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   \n").unwrap(), None);
        assert_eq!(
            parse("hello there\n").unwrap(),
            Some(Command::Send("hello there".into()))
        );
    }

    #[test]
    fn set_commands() {
        assert_eq!(
            parse("/set key AAAAAAAAAAAAAAAA").unwrap(),
            Some(Command::Set(SettingEdit::PrimaryKey(
                Key::try_from("AAAAAAAAAAAAAAAA").unwrap()
            )))
        );
        assert!(matches!(parse("/set key short"), Err(CommandError::Invalid(_))));
        assert!(matches!(parse("/set peer"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("/set colour red"), Err(CommandError::Usage(_))));
        assert!(matches!(parse("/frobnicate"), Err(CommandError::Unknown(_))));
        assert_eq!(parse("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn peer_edit_follows_radio() {
        let espnow = Settings::default();
        let next = apply(&espnow, &SettingEdit::Peer("7C:DF:A1:94:8D:80".into())).unwrap();
        assert_eq!(ChangeFlags::between(&espnow, &next), ChangeFlags::OTHER_ADDRESS);
        assert!(apply(&espnow, &SettingEdit::Peer("0x02".into())).is_err());
        assert!(matches!(
            apply(&espnow, &SettingEdit::Me("0x02".into())),
            Err(CommandError::Unsupported(_))
        ));

        let lora = Settings {
            radio: RadioType::Lora,
            ..Settings::default()
        };
        let next = apply(&lora, &SettingEdit::Me("0x02".into())).unwrap();
        assert_eq!(next.my_lora_address, LoraAddress(2));
        assert_eq!(ChangeFlags::between(&lora, &next), ChangeFlags::MY_ADDRESS);
    }

    #[test]
    fn local_key_edit_is_invisible_to_long_range() {
        let lora = Settings {
            radio: RadioType::Lora,
            ..Settings::default()
        };
        let next = apply(
            &lora,
            &SettingEdit::LocalKey(Key::try_from("BBBBBBBBBBBBBBBB").unwrap()),
        )
        .unwrap();
        assert!(ChangeFlags::between(&lora, &next).is_empty());
    }
}
